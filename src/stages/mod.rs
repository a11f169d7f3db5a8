//! The fixed provisioning sequence and its driver.
//!
//! Stage 1 (login) is the only stage whose failure ends the run. Every
//! later stage reports into the ledger and the driver moves on, so one
//! broken section of the config never hides the results of the others.
mod accounts;
mod devices;
mod external;
mod groups;
mod inquiries;
mod mass_import;
mod settings;
mod watchlist;

use crate::api::http::UreqTransport;
use crate::api::{id_of, ApiError, Gateway, PlatformVersion, Transport};
use crate::config::{LoadedConfig, RancherConfig, SshConfig};
use crate::ledger::{RunLedger, StepStatus};
use crate::poll::Backoff;
use crate::reconcile::{decide, live_entities, Decision, EntityKind, LiveEntity};
use crate::remote::{RemoteShell, SshShell};
use crate::workflow::branding::SettingsCache;
use anyhow::{Context, Result};
use chrono::Local;
use clap::ValueEnum;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    InitApi,
    SetKvParams,
    ConfigureSystem,
    ConfigureGroups,
    ConfigureAccounts,
    PopulateWatchlist,
    ConfigureDevices,
    ConfigureInquiries,
    UploadMassImport,
    ConfigureRancher,
    UploadFiles,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::InitApi,
        Stage::SetKvParams,
        Stage::ConfigureSystem,
        Stage::ConfigureGroups,
        Stage::ConfigureAccounts,
        Stage::PopulateWatchlist,
        Stage::ConfigureDevices,
        Stage::ConfigureInquiries,
        Stage::UploadMassImport,
        Stage::ConfigureRancher,
        Stage::UploadFiles,
    ];

    pub fn number(self) -> u8 {
        match self {
            Stage::InitApi => 1,
            Stage::SetKvParams => 2,
            Stage::ConfigureSystem => 3,
            Stage::ConfigureGroups => 4,
            Stage::ConfigureAccounts => 5,
            Stage::PopulateWatchlist => 6,
            Stage::ConfigureDevices => 7,
            Stage::ConfigureInquiries => 8,
            Stage::UploadMassImport => 9,
            Stage::ConfigureRancher => 10,
            Stage::UploadFiles => 11,
        }
    }

    /// Name accepted by `run --step`.
    pub fn slug(self) -> &'static str {
        match self {
            Stage::InitApi => "init-api",
            Stage::SetKvParams => "set-kv-params",
            Stage::ConfigureSystem => "configure-system",
            Stage::ConfigureGroups => "configure-groups",
            Stage::ConfigureAccounts => "configure-accounts",
            Stage::PopulateWatchlist => "populate-watchlist",
            Stage::ConfigureDevices => "configure-devices",
            Stage::ConfigureInquiries => "configure-inquiries",
            Stage::UploadMassImport => "upload-mass-import",
            Stage::ConfigureRancher => "configure-rancher",
            Stage::UploadFiles => "upload-files",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Stage::InitApi => "Initialize API Client",
            Stage::SetKvParams => "Set KV Parameters",
            Stage::ConfigureSystem => "Configure System Settings",
            Stage::ConfigureGroups => "Configure Groups",
            Stage::ConfigureAccounts => "Configure Accounts",
            Stage::PopulateWatchlist => "Populate Watch List",
            Stage::ConfigureDevices => "Configure Devices",
            Stage::ConfigureInquiries => "Configure Inquiries",
            Stage::UploadMassImport => "Upload Mass Import",
            Stage::ConfigureRancher => "Configure Rancher",
            Stage::UploadFiles => "Upload Files",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::InitApi => "Connect and authenticate with the OnWatch API",
            Stage::SetKvParams => "Configure key-value system parameters",
            Stage::ConfigureSystem => "Set general, map, engine and interface settings",
            Stage::ConfigureGroups => "Create subject groups and camera groups",
            Stage::ConfigureAccounts => "Create user groups and user accounts",
            Stage::PopulateWatchlist => "Add subjects to the watch list with images",
            Stage::ConfigureDevices => "Create cameras with thresholds and calibration",
            Stage::ConfigureInquiries => "Create inquiry cases with file uploads and ROI settings",
            Stage::UploadMassImport => "Upload a mass import file for bulk subject import",
            Stage::ConfigureRancher => "Set workload environment variables via the Rancher API",
            Stage::UploadFiles => "Upload the translation file to the appliance over SSH",
        }
    }

    /// What an operator has to do by hand when the stage does not finish.
    pub fn manual_hint(self) -> &'static str {
        match self {
            Stage::InitApi => "check the OnWatch address and credentials",
            Stage::SetKvParams => "set KV parameters manually in the UI at /bt/settings/kv",
            Stage::ConfigureSystem => "configure system settings manually in the UI",
            Stage::ConfigureGroups => "configure groups manually in the UI",
            Stage::ConfigureAccounts => "configure accounts manually in the UI",
            Stage::PopulateWatchlist => "add watch list subjects manually in the UI",
            Stage::ConfigureDevices => "configure devices manually in the UI",
            Stage::ConfigureInquiries => "configure inquiries manually in the UI",
            Stage::UploadMassImport => "upload the mass import file manually in the UI",
            Stage::ConfigureRancher => "set the Rancher environment variables manually",
            Stage::UploadFiles => "upload the translation file manually over SSH",
        }
    }
}

/// Where each external system is reached. Tests swap in fakes.
pub trait Connector {
    fn onwatch(&self) -> &dyn Transport;
    fn rancher(&self, config: &RancherConfig) -> Result<Box<dyn Transport + '_>>;
    fn remote(&self, config: &SshConfig) -> Result<Box<dyn RemoteShell + '_>>;
}

/// Real network and `ssh` connections.
pub struct LiveConnector {
    onwatch: UreqTransport,
}

impl LiveConnector {
    pub fn new(loaded: &LoadedConfig) -> Self {
        Self {
            onwatch: UreqTransport::new(&loaded.config.onwatch.api_base_url()),
        }
    }
}

impl Connector for LiveConnector {
    fn onwatch(&self) -> &dyn Transport {
        &self.onwatch
    }

    fn rancher(&self, config: &RancherConfig) -> Result<Box<dyn Transport + '_>> {
        let base_url = config.api_base_url().context("rancher connection")?;
        Ok(Box::new(UreqTransport::new(&base_url)))
    }

    fn remote(&self, config: &SshConfig) -> Result<Box<dyn RemoteShell + '_>> {
        Ok(Box::new(SshShell::new(config)?))
    }
}

/// Tally of one stage's declared entities.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Applied, but left in a state that needs a manual follow-up.
    pub incomplete: usize,
    pub notes: Vec<String>,
}

impl StageReport {
    /// A stage with nothing declared for it.
    pub fn idle(note: &str) -> Self {
        Self {
            notes: vec![note.to_string()],
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.failed + self.incomplete
    }

    pub fn status(&self) -> StepStatus {
        if self.total() == 0 {
            StepStatus::Skipped
        } else if self.failed == 0 && self.incomplete == 0 {
            StepStatus::Success
        } else if self.failed == self.total() {
            StepStatus::Failed
        } else {
            StepStatus::Partial
        }
    }

    pub fn message(&self) -> String {
        let mut parts = Vec::new();
        if self.total() > 0 {
            parts.push(format!(
                "{} applied, {} skipped, {} failed",
                self.applied, self.skipped, self.failed
            ));
            if self.incomplete > 0 {
                parts.push(format!("{} incomplete", self.incomplete));
            }
        }
        parts.extend(self.notes.iter().cloned());
        parts.join("; ")
    }
}

pub struct RunOptions {
    /// Run only this stage (after logging in).
    pub only: Option<Stage>,
    pub export_path: PathBuf,
    pub backoff: Backoff,
}

impl RunOptions {
    pub fn new(export_path: PathBuf) -> Self {
        Self {
            only: None,
            export_path,
            backoff: Backoff::default(),
        }
    }
}

/// `onwatch_data_export_<timestamp>.yaml` in the working directory.
pub fn default_export_path() -> PathBuf {
    PathBuf::from(format!(
        "onwatch_data_export_{}.yaml",
        Local::now().format("%Y-%m-%d_%H-%M-%S")
    ))
}

/// Everything a stage may touch. The ledger is passed separately so the
/// driver keeps sole ownership of it.
pub struct StageContext<'a> {
    pub loaded: &'a LoadedConfig,
    pub gateway: Gateway<'a>,
    pub connector: &'a dyn Connector,
    pub settings: SettingsCache,
    pub backoff: Backoff,
}

/// Run every stage (or the selected one) and write the export.
pub fn run(loaded: &LoadedConfig, connector: &dyn Connector, options: &RunOptions) -> RunLedger {
    let onwatch = &loaded.config.onwatch;
    let mut ledger = RunLedger::new(onwatch.ip_address.trim(), onwatch.version.trim());

    match login(loaded, connector.onwatch()) {
        Ok(gateway) => {
            ledger.record_step(
                Stage::InitApi.number(),
                Stage::InitApi.title(),
                StepStatus::Success,
                "API client initialized and logged in",
                false,
            );
            let mut ctx = StageContext {
                loaded,
                gateway,
                connector,
                settings: SettingsCache::new(),
                backoff: options.backoff,
            };
            for stage in Stage::ALL.into_iter().skip(1) {
                if options.only.is_some_and(|only| only != stage) {
                    continue;
                }
                run_stage(stage, &mut ctx, &mut ledger);
            }
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "cannot continue without an API session");
            ledger.record_step(
                Stage::InitApi.number(),
                Stage::InitApi.title(),
                StepStatus::Failed,
                &format!("{err:#} ({})", Stage::InitApi.manual_hint()),
                true,
            );
        }
    }

    ledger.finish();
    if let Err(err) = ledger.export(&options.export_path) {
        tracing::error!(error = %format!("{err:#}"), "run export not written");
    }
    ledger
}

pub(crate) fn login<'a>(loaded: &LoadedConfig, transport: &'a dyn Transport) -> Result<Gateway<'a>> {
    let onwatch = &loaded.config.onwatch;
    let version: PlatformVersion = onwatch.version.trim().parse()?;
    Gateway::login(
        transport,
        version,
        onwatch.username.trim(),
        &onwatch.password,
    )
    .with_context(|| format!("connect to {}", onwatch.api_base_url()))
}

fn run_stage(stage: Stage, ctx: &mut StageContext<'_>, ledger: &mut RunLedger) {
    let started = Instant::now();
    tracing::info!(step = stage.number(), "{}", stage.title());
    let result = match stage {
        Stage::InitApi => Ok(StageReport::idle("already logged in")),
        Stage::SetKvParams => settings::set_kv_parameters(ctx, ledger),
        Stage::ConfigureSystem => settings::configure_system(ctx, ledger),
        Stage::ConfigureGroups => groups::configure_groups(ctx, ledger),
        Stage::ConfigureAccounts => accounts::configure_accounts(ctx, ledger),
        Stage::PopulateWatchlist => watchlist::populate_watch_list(ctx, ledger),
        Stage::ConfigureDevices => devices::configure_devices(ctx, ledger),
        Stage::ConfigureInquiries => inquiries::configure_inquiries(ctx, ledger),
        Stage::UploadMassImport => mass_import::upload_mass_import(ctx, ledger),
        Stage::ConfigureRancher => external::configure_rancher(ctx, ledger),
        Stage::UploadFiles => external::upload_files(ctx, ledger),
    };
    let elapsed_ms = started.elapsed().as_millis();
    match result {
        Ok(report) => {
            let status = report.status();
            let manual = matches!(status, StepStatus::Failed | StepStatus::Partial);
            let mut message = report.message();
            if manual {
                message = format!("{message} ({})", stage.manual_hint());
                tracing::warn!(step = stage.number(), "manual action required: {}", stage.manual_hint());
            }
            tracing::info!(step = stage.number(), status = status.as_str(), elapsed_ms, "{} complete", stage.title());
            ledger.record_step(stage.number(), stage.title(), status, &message, manual);
        }
        Err(err) => {
            tracing::error!(step = stage.number(), elapsed_ms, error = %format!("{err:#}"), "{} failed", stage.title());
            tracing::warn!(step = stage.number(), "manual action required: {}", stage.manual_hint());
            ledger.record_step(
                stage.number(),
                stage.title(),
                StepStatus::Failed,
                &format!("{err:#} ({})", stage.manual_hint()),
                true,
            );
        }
    }
}

/// How a declared entity was reconciled against the appliance.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reconciled {
    /// Already present under `name`; `id` is unknown when only the
    /// create-time duplicate signal told us so.
    Existing { name: String, id: Option<String> },
    Created { id: String, record: Value },
}

/// Create `name` at `path` unless `live` already has it.
///
/// A duplicate reported by the create call itself is treated like a
/// pre-flight match: the listing is refreshed to learn the id.
pub(crate) fn reconcile_create(
    gateway: &Gateway<'_>,
    kind: EntityKind,
    path: &str,
    name: &str,
    body: Value,
    live: &mut Vec<LiveEntity>,
) -> Result<Reconciled> {
    if let Decision::Skip(existing) = decide(kind, name, live) {
        return Ok(Reconciled::Existing {
            name: existing.name.clone(),
            id: existing.id.clone(),
        });
    }
    match gateway.create(path, body) {
        Ok(record) => {
            let id = id_of(&record)
                .ok_or_else(|| anyhow::anyhow!("create {} {name}: response has no id", kind.label()))?;
            tracing::info!(kind = kind.label(), name, id = %id, "created");
            live.push(LiveEntity {
                id: Some(id.clone()),
                name: name.to_string(),
                raw: record.clone(),
            });
            Ok(Reconciled::Created { id, record })
        }
        Err(ApiError::AlreadyExists { .. }) => {
            tracing::info!(kind = kind.label(), name, "already exists (reported on create)");
            *live = live_entities(
                kind,
                gateway
                    .list_all(path)
                    .with_context(|| format!("refresh {path} listing"))?,
            );
            let id = match decide(kind, name, live) {
                Decision::Skip(existing) => existing.id.clone(),
                Decision::Create => None,
            };
            Ok(Reconciled::Existing {
                name: name.to_string(),
                id,
            })
        }
        Err(err) => Err(err).with_context(|| format!("create {} {name}", kind.label())),
    }
}

/// Skip reason naming the live spelling when it differs.
pub(crate) fn exists_reason(declared: &str, live: &str) -> String {
    if declared.trim().eq_ignore_ascii_case(live.trim()) {
        "already exists".to_string()
    } else {
        format!("already exists as '{live}'")
    }
}
