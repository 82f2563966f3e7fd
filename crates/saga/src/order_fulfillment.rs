//! Order fulfillment saga constants.

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

/// Stream suffix used to derive the saga log id from the order id.
pub const SAGA_STREAM: &str = "saga";

/// Stream suffix used to derive the outbox id from the order id.
pub const OUTBOX_STREAM: &str = "outbox";

pub const STEP_PRICE_ORDER: &str = "price_order";
pub const STEP_CHECK_AVAILABILITY: &str = "check_availability";
pub const STEP_RESERVE_STOCK: &str = "reserve_stock";
pub const STEP_CHARGE_PAYMENT: &str = "charge_payment";
pub const STEP_SCHEDULE_DELIVERY: &str = "schedule_delivery";
pub const STEP_RELEASE_STOCK: &str = "release_stock";
pub const STEP_PUBLISH_EVENT: &str = "publish_event";
pub const STEP_CANCEL_ORDER: &str = "cancel_order";

/// Order status reason recorded when payment fails for any cause.
pub const REASON_PAYMENT_FAILED: &str = "payment_failed";
