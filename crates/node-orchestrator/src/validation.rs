use crate::{OrchestratorError, Result};
use node_common::ProvisionRequest;

pub const MAX_IMAGE_NAME_LEN: usize = 255;

/// Host ports of a request that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedPorts {
    pub inbound: u16,
    pub xray: u16,
    pub api: u16,
}

impl ValidatedPorts {
    pub fn all(&self) -> [u16; 3] {
        [self.inbound, self.xray, self.api]
    }
}

/// Rejects a request before any side effect happens.
pub fn validate_request(request: &ProvisionRequest) -> Result<ValidatedPorts> {
    if request.instance_id <= 0 {
        return Err(invalid(format!(
            "instance id must be positive, got {}",
            request.instance_id
        )));
    }
    if request.customer_id <= 0 {
        return Err(invalid(format!(
            "customer id must be positive, got {}",
            request.customer_id
        )));
    }

    let image = request.image_name.trim();
    if image.is_empty() {
        return Err(invalid("image name is required"));
    }
    if image.len() > MAX_IMAGE_NAME_LEN {
        return Err(invalid(format!(
            "image name exceeds {MAX_IMAGE_NAME_LEN} characters"
        )));
    }
    if request.certificate_key.trim().is_empty() {
        return Err(invalid("certificate content is required"));
    }

    let ports = ValidatedPorts {
        inbound: port("inbound", request.inbound_port)?,
        xray: port("xray", request.xray_port)?,
        api: port("api", request.api_port)?,
    };
    if ports.inbound == ports.xray || ports.inbound == ports.api || ports.xray == ports.api {
        return Err(invalid(format!(
            "inbound, xray and api ports must differ, got {}, {} and {}",
            ports.inbound, ports.xray, ports.api
        )));
    }
    Ok(ports)
}

fn port(name: &str, value: i32) -> Result<u16> {
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(invalid(format!(
            "{name} port must be between 1 and 65535, got {value}"
        ))),
    }
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Validation(message.into())
}
