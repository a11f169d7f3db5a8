//! Stages 10 and 11: systems reached outside the OnWatch API.
use super::{StageContext, StageReport};
use crate::config::scalar_text;
use crate::ledger::{Category, RunLedger};
use crate::rancher::{parse_workload_path, RancherClient, WorkloadRef};
use crate::remote::upload_translation;
use crate::util::file_name_of;
use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::collections::BTreeMap;

pub(super) fn configure_rancher(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let config = &loaded.config;
    if config.env_vars.is_empty() {
        return Ok(StageReport::idle("no environment variables declared"));
    }
    let rancher = config
        .rancher
        .as_ref()
        .ok_or_else(|| anyhow!("env_vars declared but the rancher section is missing"))?;
    let declared: BTreeMap<String, String> = config
        .env_vars
        .iter()
        .map(|(key, value)| (key.clone(), scalar_text(value)))
        .collect();

    let transport = ctx.connector.rancher(rancher)?;
    let client = RancherClient::login(transport.as_ref(), rancher.username.trim(), &rancher.password)?;
    let workload = match rancher.workload_path.as_deref() {
        Some(path) => parse_workload_path(path)?,
        None => WorkloadRef::default(),
    };
    let project = match rancher
        .project_id
        .as_deref()
        .map(str::trim)
        .filter(|project| !project.is_empty())
        .map(str::to_string)
        .or_else(|| workload.project_id.clone())
    {
        Some(project) => project,
        None => client.discover_project(workload.namespace())?,
    };

    client.set_env_vars(&project, &workload.workload_id, &declared)?;
    let confirmed = client
        .confirmed_env_vars(&project, &workload.workload_id, &declared)
        .context("re-read workload environment")?;

    let mut report = StageReport::default();
    for (key, value) in &declared {
        if confirmed.contains_key(key) {
            ledger.add_created_item(
                Category::RancherEnvVars,
                json!({
                    "key": key,
                    "value": value,
                    "workload": workload.workload_id,
                    "project": project,
                }),
            );
            report.applied += 1;
        } else {
            tracing::warn!(key = %key, workload = %workload.workload_id, "environment variable not confirmed");
            ledger.add_warning(format!(
                "Environment variable {key} was sent to {} but the workload does not show it yet",
                workload.workload_id
            ));
            report.incomplete += 1;
        }
    }
    Ok(report)
}

pub(super) fn upload_files(
    ctx: &mut StageContext<'_>,
    ledger: &mut RunLedger,
) -> Result<StageReport> {
    let loaded = ctx.loaded;
    let Some(translation) = loaded
        .config
        .system_settings
        .system_interface
        .as_ref()
        .and_then(|interface| interface.translation_file.as_ref())
        .filter(|path| !path.as_os_str().is_empty())
    else {
        return Ok(StageReport::idle("no translation file declared"));
    };
    let ssh = loaded
        .config
        .ssh
        .as_ref()
        .ok_or_else(|| anyhow!("translation_file declared but the ssh section is missing"))?;
    let local = loaded.resolve(translation);
    let shell = ctx.connector.remote(ssh)?;
    let remote_path = upload_translation(shell.as_ref(), ssh, &local)?;
    ledger.add_created_item(
        Category::TranslationFile,
        json!({
            "file": file_name_of(&local),
            "remote_path": remote_path,
            "host": ssh.ip_address.trim(),
        }),
    );
    Ok(StageReport {
        applied: 1,
        ..StageReport::default()
    })
}
