//! Label keys and values stamped on engine objects
//!
//! Every crate that creates containers labels them with these, so objects
//! of one enclave can be found again by label.

/// Enclave an object belongs to
pub const ENCLAVE_ID_LABEL: &str = "enclave.id";
/// Role of a container inside its enclave
pub const CONTAINER_TYPE_LABEL: &str = "enclave.container-type";
/// Service ID of a user service container
pub const SERVICE_ID_LABEL: &str = "enclave.service-id";
/// Registration GUID of the service a container serves
pub const SERVICE_GUID_LABEL: &str = "enclave.service-guid";

/// [`CONTAINER_TYPE_LABEL`] value of the control plane
pub const CONTROL_PLANE_CONTAINER_TYPE: &str = "control-plane";
/// [`CONTAINER_TYPE_LABEL`] value of user services
pub const USER_SERVICE_CONTAINER_TYPE: &str = "user-service";
/// [`CONTAINER_TYPE_LABEL`] value of firewall sidecars
pub const SIDECAR_CONTAINER_TYPE: &str = "networking-sidecar";
