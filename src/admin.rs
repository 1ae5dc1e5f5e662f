//! Admin client facade (§4.7), grounded on `component/admin/admin.py`: a
//! thin named wrapper around the `AdminApi` surface that carries the
//! admin's own common name so callers don't repeat it on every call.

use crate::coordinator::AdminApi;
use crate::coordinator::wire::ExperimentStatus;
use std::sync::Arc;
use tracing::info;

/// Binds an admin's common name to a coordinator handle. `cert_common_name`
/// is passed in separately per call, mirroring the mTLS identity a real
/// transport would supply out of band from the RPC body.
pub struct Admin {
    admin_common_name: String,
    coordinator: Arc<dyn AdminApi>,
}

impl Admin {
    pub fn new(admin_common_name: impl Into<String>, coordinator: Arc<dyn AdminApi>) -> Self {
        Self { admin_common_name: admin_common_name.into(), coordinator }
    }

    pub async fn add_collaborator(
        &self,
        cert_common_name: &str,
        collaborator_label: &str,
        collaborator_cn: &str,
    ) -> anyhow::Result<()> {
        info!(collaborator = collaborator_cn, "adding collaborator");
        self.coordinator
            .add_collaborator(cert_common_name, &self.admin_common_name, collaborator_label, collaborator_cn)
            .await
    }

    pub async fn remove_collaborator(
        &self,
        cert_common_name: &str,
        collaborator_label: &str,
        collaborator_cn: &str,
    ) -> anyhow::Result<()> {
        info!(collaborator = collaborator_cn, "removing collaborator");
        self.coordinator
            .remove_collaborator(cert_common_name, &self.admin_common_name, collaborator_label, collaborator_cn)
            .await
    }

    pub async fn get_experiment_status(&self, cert_common_name: &str) -> anyhow::Result<ExperimentStatus> {
        info!("querying experiment status");
        self.coordinator.get_experiment_status(cert_common_name, &self.admin_common_name).await
    }

    pub async fn set_straggler_cutoff_time(&self, cert_common_name: &str, straggler_cutoff_time_secs: f64) -> anyhow::Result<()> {
        info!(straggler_cutoff_time_secs, "updating straggler cutoff time");
        self.coordinator
            .set_straggler_cutoff_time(cert_common_name, &self.admin_common_name, straggler_cutoff_time_secs)
            .await
    }

    pub async fn set_dynamic_task_arg(
        &self,
        cert_common_name: &str,
        task_name: &str,
        arg_name: &str,
        value: f64,
    ) -> anyhow::Result<()> {
        info!(task_name, arg_name, value, "setting dynamic task arg");
        self.coordinator
            .set_dynamic_task_arg(cert_common_name, &self.admin_common_name, task_name, arg_name, value)
            .await
    }

    pub async fn get_dynamic_task_arg(
        &self,
        cert_common_name: &str,
        task_name: &str,
        arg_name: &str,
    ) -> anyhow::Result<(Option<f64>, f64)> {
        info!(task_name, arg_name, "querying dynamic task arg");
        self.coordinator.get_dynamic_task_arg(cert_common_name, &self.admin_common_name, task_name, arg_name).await
    }
}
