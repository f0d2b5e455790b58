pub mod cart;
pub mod cart_item;
pub mod payment_correlation;
pub mod product;
