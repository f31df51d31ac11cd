//! Server state

use std::sync::Arc;

use crate::authn::signature::SignatureVerifier;
use crate::deploy::executor::DeploymentExecutor;
use crate::deploy::gate::GateOptions;
use crate::storage::settings::ExecutionPolicy;

/// Server state shared across handlers
pub struct ServerState {
    pub verifier: Arc<SignatureVerifier>,
    pub gate: GateOptions,
    pub policy: ExecutionPolicy,
    pub executor: Arc<DeploymentExecutor>,
}

impl ServerState {
    pub fn new(
        verifier: Arc<SignatureVerifier>,
        gate: GateOptions,
        policy: ExecutionPolicy,
        executor: Arc<DeploymentExecutor>,
    ) -> Self {
        Self {
            verifier,
            gate,
            policy,
            executor,
        }
    }
}
