//! Upper-layer interface.

use bytes::Bytes;

use crate::error::DropReason;
use crate::frame::Address;

/// Upper-layer (network) collaborator the MAC reports to, injected at
/// construction
pub trait UpperLayer {
    /// Deliver a received payload addressed to this node or broadcast
    fn deliver(&mut self, src: Address, payload: Bytes);

    /// Report an outgoing payload the MAC gave up on
    fn dropped(&mut self, dest: Address, payload: Bytes, reason: DropReason);
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::*;

    #[derive(Debug, Default)]
    struct Inner {
        delivered: Vec<(Address, Bytes)>,
        dropped: Vec<(Address, Bytes, DropReason)>,
    }

    /// Mock upper layer collecting deliveries and drop notifications
    #[derive(Clone, Debug)]
    pub struct MockUpper(Arc<Mutex<Inner>>);

    impl MockUpper {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner::default())))
        }

        pub fn delivered(&self) -> Vec<(Address, Bytes)> {
            self.0.lock().unwrap().delivered.clone()
        }

        pub fn drops(&self) -> Vec<(Address, Bytes, DropReason)> {
            self.0.lock().unwrap().dropped.clone()
        }
    }

    impl UpperLayer for MockUpper {
        fn deliver(&mut self, src: Address, payload: Bytes) {
            self.0.lock().unwrap().delivered.push((src, payload));
        }

        fn dropped(&mut self, dest: Address, payload: Bytes, reason: DropReason) {
            self.0.lock().unwrap().dropped.push((dest, payload, reason));
        }
    }
}
