//! Provisioning orchestrator: resolves user-supplied identifiers against
//! existing remote resources, creates what is missing, assembles the agent
//! bundle, and deletes whatever this run created if a later step fails.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use asoc::{AsocApi, AsocClient, ScanInfo, REPORT_POLL_INTERVAL};
use iastkit_core::{AGENT_TEMP_ZIP, AGENT_ZIP, ASOC_CONFIG_FILENAME, WAR_NAME};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Everything one provisioning run needs, resolved up front.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub key_id: String,
    pub key_secret: String,
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub scan_id: Option<String>,
    pub scan_name: Option<String>,
    pub asset_group: Option<String>,
    /// Where the finished bundle lands; staging lives underneath it.
    pub work_dir: PathBuf,
}

#[derive(Debug)]
pub struct ProvisionOutcome {
    pub app_id: String,
    pub app_name: String,
    pub scan_id: String,
    pub scan_name: String,
    pub agent_key: String,
    pub app_created: bool,
    pub scan_created: bool,
    pub bundle: PathBuf,
}

/// Mutable resolution state threaded through the run. The `*_created`
/// flags mark exactly what the compensation pass may delete.
#[derive(Debug, Default)]
struct Resolution {
    app_id: Option<String>,
    app_name: Option<String>,
    scan_id: Option<String>,
    scan_name: Option<String>,
    asset_group: Option<String>,
    agent_key: Option<String>,
    app_created: bool,
    scan_created: bool,
}

impl Resolution {
    fn new(req: &ProvisionRequest) -> Self {
        Resolution {
            app_id: req.app_id.clone(),
            app_name: req.app_name.clone(),
            scan_id: req.scan_id.clone(),
            scan_name: req.scan_name.clone(),
            asset_group: req.asset_group.clone(),
            ..Resolution::default()
        }
    }
}

pub async fn provision<A: AsocApi + Sync>(
    api: &A,
    req: &ProvisionRequest,
) -> Result<ProvisionOutcome> {
    let token = api.api_key_login(&req.key_id, &req.key_secret).await?;
    let mut st = Resolution::new(req);
    match run(api, &token, req, &mut st).await {
        Ok(bundle) => Ok(ProvisionOutcome {
            app_id: st.app_id.ok_or_else(|| anyhow!("application id unresolved"))?,
            app_name: st.app_name.ok_or_else(|| anyhow!("application name unresolved"))?,
            scan_id: st.scan_id.ok_or_else(|| anyhow!("scan id unresolved"))?,
            scan_name: st.scan_name.ok_or_else(|| anyhow!("scan name unresolved"))?,
            agent_key: st.agent_key.ok_or_else(|| anyhow!("agent key unresolved"))?,
            app_created: st.app_created,
            scan_created: st.scan_created,
            bundle,
        }),
        Err(err) => {
            error!("an error has occurred: {err:#}");
            compensate(api, &token, &st).await;
            Err(err)
        }
    }
}

async fn run<A: AsocApi + Sync>(
    api: &A,
    token: &str,
    req: &ProvisionRequest,
    st: &mut Resolution,
) -> Result<PathBuf> {
    resolve_scan(api, token, st).await?;
    resolve_app(api, token, st).await?;
    ensure_app(api, token, st).await?;
    ensure_scan(api, token, st).await?;
    assemble_bundle(api, st, &req.work_dir).await
}

/// Steps 1–2: an existing scan short-circuits all later resolution.
async fn resolve_scan<A: AsocApi + Sync>(
    api: &A,
    token: &str,
    st: &mut Resolution,
) -> Result<()> {
    if let Some(scan_id) = st.scan_id.clone() {
        let info = api
            .scan_info_by_id(token, &scan_id)
            .await?
            .ok_or_else(|| anyhow!("given scan id {scan_id} not found for the given credentials"))?;
        verify_consistent(st, &info, &format!("given scan id {scan_id}"))?;
        adopt_scan(st, &info);
        rotate_key(api, token, st).await?;
    } else if let Some(scan_name) = st.scan_name.clone() {
        if let Some(info) = api.scan_info_by_name(token, &scan_name).await? {
            verify_consistent(st, &info, &format!("given scan name {scan_name}"))?;
            adopt_scan(st, &info);
            rotate_key(api, token, st).await?;
        }
        // not found: the name is used later to create a new scan
    }
    Ok(())
}

/// Every identifier the user supplied must agree with the record found.
fn verify_consistent(st: &Resolution, info: &ScanInfo, given: &str) -> Result<()> {
    if let Some(scan_name) = &st.scan_name {
        if scan_name != &info.scan_name {
            bail!("given scan name '{scan_name}' does not match the {given}");
        }
    }
    if let Some(app_id) = &st.app_id {
        if app_id != &info.app_id {
            bail!("given app id {app_id} does not match the {given}");
        }
    }
    if let Some(app_name) = &st.app_name {
        if app_name != &info.app_name {
            bail!("given app name '{app_name}' does not match the {given}");
        }
    }
    Ok(())
}

fn adopt_scan(st: &mut Resolution, info: &ScanInfo) {
    st.scan_id = Some(info.scan_id.clone());
    st.scan_name = Some(info.scan_name.clone());
    st.app_name = Some(info.app_name.clone());
    st.app_id = Some(info.app_id.clone());
    info!(
        "configuring IAST agent to associate to existing scan {} with id {}",
        info.scan_name, info.scan_id
    );
}

/// Issues a fresh key for an existing scan, invalidating the previous one.
async fn rotate_key<A: AsocApi + Sync>(api: &A, token: &str, st: &mut Resolution) -> Result<()> {
    let scan_id = st.scan_id.as_deref().ok_or_else(|| anyhow!("scan id unresolved"))?;
    warn!(
        "reusing an existing scan generates a new access token and invalidates the previous one; \
         running agents still using it will no longer reach the service"
    );
    let key = api
        .new_agent_key(token, scan_id)
        .await?
        .ok_or_else(|| anyhow!("no key available for scan {scan_id}"))?;
    st.agent_key = Some(key);
    Ok(())
}

/// Step 3: verify or look up the application, whether user-given or
/// adopted from the scan lookup.
async fn resolve_app<A: AsocApi + Sync>(api: &A, token: &str, st: &mut Resolution) -> Result<()> {
    if let Some(app_id) = st.app_id.clone() {
        let name = api
            .app_by_id(token, &app_id)
            .await?
            .ok_or_else(|| anyhow!("given app id {app_id} not found for the given credentials"))?;
        if let Some(app_name) = &st.app_name {
            if app_name != &name {
                bail!("given app name '{app_name}' does not match the given app id {app_id}");
            }
        }
        st.app_name = Some(name.clone());
        info!("configuring IAST agent to associate to existing application {name} with id {app_id}");
    } else if let Some(app_name) = st.app_name.clone() {
        if let Some(app_id) = api.app_id_by_name(token, &app_name).await? {
            info!(
                "configuring IAST agent to associate to existing application {app_name} with id {app_id}"
            );
            st.app_id = Some(app_id);
        }
    }
    Ok(())
}

/// Step 4: create an application only when none resolved.
async fn ensure_app<A: AsocApi + Sync>(api: &A, token: &str, st: &mut Resolution) -> Result<()> {
    if st.app_id.is_some() {
        return Ok(());
    }
    info!("creating a new application");
    let asset_group = match &st.asset_group {
        Some(group) => group.clone(),
        None => api.default_asset_group(token).await?,
    };
    let app_name = st
        .app_name
        .get_or_insert_with(|| format!("iast-app-{}", time_suffix()))
        .clone();
    let app_id = api.create_app(token, &app_name, &asset_group).await?;
    info!("created a new application {app_name} with id {app_id}");
    st.app_id = Some(app_id);
    st.app_created = true;
    Ok(())
}

/// Step 5: create a scan only when none resolved; its first agent key
/// arrives with the creation response.
async fn ensure_scan<A: AsocApi + Sync>(api: &A, token: &str, st: &mut Resolution) -> Result<()> {
    if st.scan_id.is_some() {
        return Ok(());
    }
    info!("creating a new scan");
    let app_id = st.app_id.clone().ok_or_else(|| anyhow!("application id unresolved"))?;
    let scan_name = st
        .scan_name
        .get_or_insert_with(|| format!("iast-scan-{}", time_suffix()))
        .clone();
    let created = api.create_scan(token, &app_id, &scan_name).await?;
    info!("created a new scan {scan_name} with id {}", created.scan_id);
    st.scan_id = Some(created.scan_id);
    st.agent_key = Some(created.agent_key);
    st.scan_created = true;
    Ok(())
}

/// Step 6: download the agent, embed the key, re-publish the bundle.
/// Staging and the loose config file are cleaned up on every exit path.
async fn assemble_bundle<A: AsocApi + Sync>(
    api: &A,
    st: &Resolution,
    work_dir: &Path,
) -> Result<PathBuf> {
    let agent_key = st.agent_key.as_deref().ok_or_else(|| anyhow!("no agent key resolved"))?;
    let staging = archive::StagingDir::create(work_dir.join("temp"))?;
    let temp_zip = staging.path().join(AGENT_TEMP_ZIP);
    api.download_agent(agent_key, &temp_zip).await?;
    info!("extracting agent bundle");
    archive::extract(&temp_zip, staging.path())?;
    let war = staging.path().join(WAR_NAME);
    if !war.exists() {
        bail!("agent bundle did not contain {WAR_NAME}");
    }
    info!("copying {ASOC_CONFIG_FILENAME} into {WAR_NAME}");
    let config = archive::write_agent_config(staging.path(), agent_key, None)?;
    archive::add_file_to_archive(&war, config.path())?;
    drop(config);
    info!("zipping {AGENT_ZIP}");
    let packed = staging.path().join(AGENT_ZIP);
    archive::pack_dir(staging.path(), &packed)?;
    let bundle = work_dir.join(AGENT_ZIP);
    fs::copy(&packed, &bundle)
        .with_context(|| format!("publishing {}", bundle.display()))?;
    Ok(bundle)
}

/// Deletes exactly the resources this run created. Failures here are
/// reported but neither retried nor escalated.
async fn compensate<A: AsocApi + Sync>(api: &A, token: &str, st: &Resolution) {
    if st.app_created {
        if let Some(app_id) = &st.app_id {
            let app_name = st.app_name.as_deref().unwrap_or_default();
            warn!("deleting application {app_name} with id {app_id}");
            if let Err(e) = api.delete_app(token, app_id).await {
                error!("failed to delete application {app_id}: {e}");
            }
        }
    }
    if st.scan_created {
        if let Some(scan_id) = &st.scan_id {
            let scan_name = st.scan_name.as_deref().unwrap_or_default();
            warn!("deleting scan {scan_name} with id {scan_id}");
            if let Err(e) = api.delete_scan(token, scan_id).await {
                error!("failed to delete scan {scan_id}: {e}");
            }
        }
    }
}

fn time_suffix() -> String {
    let now = OffsetDateTime::now_utc();
    format!("{:02}-{:02}-{:02}", now.hour(), now.minute(), now.second())
}

/// Report pipeline: create, poll until terminal, download. Reports carry
/// no cleanup obligations, so there is no compensation here.
pub async fn fetch_report(
    client: &AsocClient,
    token: &str,
    scan_id: &str,
    max_retries: u32,
) -> Result<String> {
    let report_id = client.create_report(token, scan_id).await?;
    client
        .wait_for_report_ready(token, &report_id, max_retries, REPORT_POLL_INTERVAL)
        .await?;
    let report = client.download_report(token, &report_id).await?;
    Ok(report)
}
