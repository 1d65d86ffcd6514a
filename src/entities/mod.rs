pub mod cart;
pub mod cart_item;
pub mod payment;
pub mod payment_item;
pub mod product;
pub mod user;

pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use payment::{DeliveryStatus, Entity as Payment, Model as PaymentModel, PaymentStatus};
pub use payment_item::{Entity as PaymentItem, Model as PaymentItemModel};
pub use product::{Entity as Product, Model as ProductModel};
pub use user::{Entity as User, Model as UserModel, UserRole};
