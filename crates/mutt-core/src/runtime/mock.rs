use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use mutt_transport::{Endpoint, EndpointId, Transport, TransportError};

/// Transport double that records sends.
#[derive(Clone)]
pub struct MockTransport {
    endpoint: Endpoint,
    sent: Arc<Mutex<Vec<(EndpointId, Vec<u8>)>>>,
    fail_sends: Arc<Mutex<bool>>,
    failing: Arc<Mutex<HashSet<EndpointId>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            endpoint: Endpoint::new(EndpointId::from("mock"), "mock"),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(Mutex::new(false)),
            failing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn sent(&self) -> Vec<(EndpointId, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }

    pub fn fail_target(&self, target: EndpointId) {
        self.failing.lock().unwrap().insert(target);
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, to: &EndpointId, data: &[u8]) -> Result<(), TransportError> {
        if *self.fail_sends.lock().unwrap() || self.failing.lock().unwrap().contains(to) {
            return Err(TransportError::NotConnected(to.clone()));
        }
        self.sent.lock().unwrap().push((to.clone(), data.to_vec()));
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        32 * 1024
    }

    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
