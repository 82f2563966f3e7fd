//! Order status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The status of an order in its fulfillment lifecycle.
///
/// ```text
/// pending ─► priced ─► reserved ─► paid ─► delivery_scheduled ─► completed
///              │          │          └──────────────────────────────▲
///              │          └─► payment_failed ─► compensating ─► cancelled
///              └─► reservation_failed ─────────────────────────► cancelled
///
/// failed: unrecoverable dependency error after retries
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order recorded, prices not yet captured.
    #[default]
    Pending,

    /// Authoritative unit prices captured and total computed.
    Priced,

    /// Stock reserved for every line item.
    Reserved,

    /// At least one reservation was refused; releases pending.
    ReservationFailed,

    /// Payment captured.
    Paid,

    /// Payment declined or unreachable; releases pending.
    PaymentFailed,

    /// Reservations are being released.
    Compensating,

    /// Delivery booked with the delivery service.
    DeliveryScheduled,

    /// Terminal: fulfilled.
    Completed,

    /// Terminal: rolled back.
    Cancelled,

    /// Terminal: gave up after exhausting retries or failing to compensate.
    Failed,
}

impl OrderStatus {
    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Priced | Cancelled | Failed)
                | (Priced, Reserved | ReservationFailed | Cancelled | Failed)
                | (Reserved, Paid | PaymentFailed | Compensating)
                | (ReservationFailed, Cancelled | Failed)
                | (PaymentFailed, Compensating)
                | (Compensating, Cancelled | Failed)
                | (Paid, DeliveryScheduled | Completed)
                | (DeliveryScheduled, Completed)
        )
    }

    /// Returns true if this is a terminal status (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Returns true if stock may be held for the order in this status.
    pub fn may_hold_reservations(&self) -> bool {
        matches!(
            self,
            OrderStatus::Priced
                | OrderStatus::Reserved
                | OrderStatus::ReservationFailed
                | OrderStatus::PaymentFailed
                | OrderStatus::Compensating
                | OrderStatus::Paid
                | OrderStatus::DeliveryScheduled
                | OrderStatus::Completed
        )
    }

    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Priced => "priced",
            OrderStatus::Reserved => "reserved",
            OrderStatus::ReservationFailed => "reservation_failed",
            OrderStatus::Paid => "paid",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::Compensating => "compensating",
            OrderStatus::DeliveryScheduled => "delivery_scheduled",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => OrderStatus::Pending,
            "priced" => OrderStatus::Priced,
            "reserved" => OrderStatus::Reserved,
            "reservation_failed" => OrderStatus::ReservationFailed,
            "paid" => OrderStatus::Paid,
            "payment_failed" => OrderStatus::PaymentFailed,
            "compensating" => OrderStatus::Compensating,
            "delivery_scheduled" => OrderStatus::DeliveryScheduled,
            "completed" => OrderStatus::Completed,
            "cancelled" => OrderStatus::Cancelled,
            "failed" => OrderStatus::Failed,
            other => return Err(format!("unknown order status: {other}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 11] = [
        OrderStatus::Pending,
        OrderStatus::Priced,
        OrderStatus::Reserved,
        OrderStatus::ReservationFailed,
        OrderStatus::Paid,
        OrderStatus::PaymentFailed,
        OrderStatus::Compensating,
        OrderStatus::DeliveryScheduled,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Failed,
    ];

    #[test]
    fn happy_path_is_legal() {
        use OrderStatus::*;
        let path = [Pending, Priced, Reserved, Paid, DeliveryScheduled, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn backwards_moves_are_rejected() {
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Reserved));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Reserved.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn pending_orders_hold_no_stock() {
        assert!(!OrderStatus::Pending.may_hold_reservations());
        assert!(!OrderStatus::Cancelled.may_hold_reservations());
        assert!(OrderStatus::Compensating.may_hold_reservations());
    }

    #[test]
    fn wire_names_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("shipped".parse::<OrderStatus>().is_err());
    }
}
