//! Read model views.

pub mod user_orders;

pub use user_orders::UserOrdersView;
