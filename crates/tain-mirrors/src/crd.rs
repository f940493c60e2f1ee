//! Application Custom Resource Definition
//!
//! Applications group workloads for reporting; unlike the builtin kinds they
//! have no upstream Kubernetes type, so the CRD is declared here and watched
//! like any other mirrored kind.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of an Application
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "tain.dev",
    version = "v1alpha1",
    kind = "Application",
    namespaced,
    status = "ApplicationStatus",
    shortname = "app"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Human-readable name shown in reporting; operators may override the
    /// mirrored copy, so an unset value never clobbers a stored one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Owning team or user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Names of workloads composing this application
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
}

/// Observed state of an Application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Lifecycle phase (Pending, Ready, Degraded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}
