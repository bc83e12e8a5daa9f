//! staffline/crates/sl-core/src/lib.rs
//!
//! The relay core of Staffline: thread lifecycle, block policy, closure
//! scheduling and the port traits every plugin implements.

pub mod block;
pub mod config;
pub mod context;
pub mod duration;
pub mod error;
pub mod models;
pub mod reactions;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod thread;
pub mod traits;

// Re-exporting for easier access in other crates
pub use block::{BlockKind, BlockPolicy, Decision};
pub use config::{keys, CancelPolicy, ConfigCache};
pub use context::RelayContext;
pub use error::*;
pub use models::*;
pub use reactions::ReactionAction;
pub use registry::ThreadRegistry;
pub use relay::{InboundOutcome, Relay};
pub use scheduler::{ClosureScheduler, FireJob, RecoveryReport};
pub use thread::{SendOutcome, Thread};
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::models::*;

    #[test]
    fn test_snowflake_ids_round_trip_through_text() {
        let id: UserId = "104857600".parse().unwrap();
        assert_eq!(id, UserId(104857600));
        assert_eq!(id.to_string(), "104857600");
        assert!("not-an-id".parse::<ChannelId>().is_err());
    }

    #[test]
    fn test_closer_labels() {
        let closer = Closer::user(UserId(7), "mod");
        assert_eq!(closer.label(), "mod");
        assert_eq!(closer.user_id(), Some(UserId(7)));
        assert_eq!(Closer::Automatic.user_id(), None);
    }
}
