//! Macros for reducing message boilerplate.

/// Implement [`Message`](crate::Message) for a serde-enabled type.
///
/// The second argument is the stable message type; an optional list of
/// supertypes enables polymorphic dispatch.
///
/// # Example
///
/// ```ignore
/// use courier_core::impl_message;
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: Uuid,
///     amount: u64,
/// }
///
/// impl_message!(OrderPlaced, "orders:OrderPlaced");
///
/// // With supertypes, consumers of `orders:OrderEvent` receive it too
/// impl_message!(OrderShipped, "orders:OrderShipped", ["orders:OrderEvent"]);
/// ```
#[macro_export]
macro_rules! impl_message {
    ($ty:ty, $name:expr) => {
        impl $crate::Message for $ty {
            const MESSAGE_TYPE: &'static str = $name;
        }
    };
    ($ty:ty, $name:expr, [$($supertype:expr),* $(,)?]) => {
        impl $crate::Message for $ty {
            const MESSAGE_TYPE: &'static str = $name;
            const SUPERTYPES: &'static [&'static str] = &[$($supertype),*];
        }
    };
}
