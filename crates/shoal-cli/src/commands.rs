use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use shoal_alarm::{
    apply_plan, build_update_plan, compute_wanted, create_window, event_catalog, ApplyOptions,
    HttpMonitor, HttpMonitorConfig, MaintScope, MonitoringApi, NewMaintWindow,
};
use shoal_deploy::{
    execute, plan as build_plan, ConfirmFn, ExecuteOptions, HttpBackend, HttpBackendConfig,
    Operation, PlanOptions,
};
use shoal_dispatch::{
    consume, resolve_scope, AmqpConfig, AmqpTransport, Dispatcher, DispatchOptions, FleetOperation,
    OutputFormat, Scope, TextMode,
};
use shoal_domain::catalog;
use shoal_inventory::{load_snapshot, FleetSnapshot, HttpInventory, HttpInventoryConfig, InventoryApi, LoaderOptions};
use shoal_layout::{generate_from_hardware, read_hardware_config, DesiredLayout, LayoutTemplate};
use shoal_ring::{audit, repair, RingConfig};
use tokio::sync::watch;
use tracing::debug;

use crate::cli::{
    AlarmCommand, AlarmConfigCommand, Endpoints, FleetArgs, MaintCommand, NotifyMode, TemplateArg,
    ZkCommand,
};
use crate::output;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Notification contacts attached to probe groups this toolkit creates.
const ALARM_CONTACTS: &[&str] = &["email"];

/// A usage error raised after argument parsing: bad identifiers or argument
/// combinations clap cannot catch. Maps to exit code 2, unlike operational
/// failures.
#[derive(Debug)]
pub struct UsageError(pub String);

impl std::fmt::Display for UsageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

fn inventory(endpoints: &Endpoints) -> Result<HttpInventory> {
    Ok(HttpInventory::new(HttpInventoryConfig {
        registry_url: endpoints.registry_url.clone(),
        vms_url: endpoints.vms_url.clone(),
        cn_url: endpoints.cn_url.clone(),
        images_url: endpoints.images_url.clone(),
        request_timeout: REQUEST_TIMEOUT,
    })?)
}

fn monitor(endpoints: &Endpoints) -> Result<HttpMonitor> {
    Ok(HttpMonitor::new(HttpMonitorConfig {
        base_url: endpoints.monitor_url.clone(),
        request_timeout: REQUEST_TIMEOUT,
    })?)
}

async fn snapshot(endpoints: &Endpoints, api: &dyn InventoryApi) -> Result<FleetSnapshot> {
    let opts = LoaderOptions {
        application: endpoints.application.clone(),
        ..Default::default()
    };
    load_snapshot(api, &opts)
        .await
        .context("loading fleet snapshot")
}

fn check_service(service: &Option<String>) -> Result<()> {
    if let Some(name) = service {
        if !catalog::is_valid(name) {
            bail!(UsageError(format!("unknown service: {}", name)));
        }
    }
    Ok(())
}

fn prompt(question: &str) -> bool {
    print!("{} [y/N] ", question);
    let _ = io::stdout().flush();
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y" | "yes")
}

// ── show / cn ────────────────────────────────────────────────────────────────

pub async fn show(
    endpoints: &Endpoints,
    service: Option<String>,
    summary: bool,
    bycn: bool,
    json: bool,
    all: bool,
) -> Result<u8> {
    check_service(&service)?;
    let api = inventory(endpoints)?;
    let snap = snapshot(endpoints, &api).await?;

    let rendered = if json {
        output::render_layout_json(&snap)?
    } else if summary {
        output::render_summary(&snap, service.as_deref())
    } else if bycn {
        output::render_by_compute(&snap, service.as_deref())
    } else {
        output::render_instances(&snap, service.as_deref(), all)
    };
    print!("{}", rendered);
    Ok(0)
}

pub async fn cn(
    endpoints: &Endpoints,
    filter: Option<String>,
    storage_only: bool,
    no_header: bool,
    columns: Vec<String>,
) -> Result<u8> {
    let api = inventory(endpoints)?;
    let snap = snapshot(endpoints, &api).await?;
    match output::render_compute_nodes(&snap, filter.as_deref(), storage_only, no_header, &columns)
    {
        Ok(rendered) => {
            print!("{}", rendered);
            Ok(0)
        }
        Err(message) => bail!("{}", message),
    }
}

// ── genconfig ────────────────────────────────────────────────────────────────

pub async fn genconfig(
    endpoints: &Endpoints,
    template: Option<TemplateArg>,
    from_file: Option<PathBuf>,
    directory: Option<PathBuf>,
) -> Result<u8> {
    let api = inventory(endpoints)?;
    let snap = snapshot(endpoints, &api).await?;

    match (template, from_file) {
        (Some(template), None) => {
            let template = match template {
                TemplateArg::Standalone => LayoutTemplate::Standalone,
                TemplateArg::Development => LayoutTemplate::Development,
            };
            let layout = template.generate(&snap)?;
            print!("{:#}\n", layout.to_json());
            Ok(0)
        }
        (None, Some(path)) => {
            let config = read_hardware_config(&path)?;
            let generated = generate_from_hardware(&config, &snap)?;
            for issue in &generated.issues {
                eprintln!("issue: {}", issue);
            }
            match (&directory, generated.single()) {
                (Some(dir), _) => {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("creating {}", dir.display()))?;
                    for path in generated.write_all(dir)? {
                        println!("wrote {}", path.display());
                    }
                }
                (None, Some(layout)) => print!("{:#}\n", layout.to_json()),
                (None, None) => {
                    bail!("multiple availability zones; use --directory")
                }
            }
            if generated.issue_count() > 0 {
                eprintln!("{} issue(s) found", generated.issue_count());
                return Ok(1);
            }
            Ok(0)
        }
        (None, None) | (Some(_), Some(_)) => bail!(UsageError(
            "specify a template or --from-file, not both".to_string()
        )),
    }
}

// ── update ───────────────────────────────────────────────────────────────────

pub async fn update(
    endpoints: &Endpoints,
    path: PathBuf,
    service: Option<String>,
    dry_run: bool,
    pre_confirmed: bool,
    no_reprovision: bool,
) -> Result<u8> {
    check_service(&service)?;
    let desired = DesiredLayout::read(&path)?;
    let api = inventory(endpoints)?;
    let snap = snapshot(endpoints, &api).await?;

    let opts = PlanOptions {
        service,
        allow_reprovision: !no_reprovision,
    };
    let plan = build_plan(&snap, &desired, &opts)?;
    print!("{}", output::render_plan(&plan));
    if plan.is_empty() || dry_run {
        return Ok(0);
    }

    let backend = Arc::new(HttpBackend::new(HttpBackendConfig {
        base_url: endpoints.registry_url.clone(),
        request_timeout: REQUEST_TIMEOUT,
    })?);
    let confirm: ConfirmFn = if pre_confirmed {
        Box::new(|_: &[Operation]| true)
    } else {
        Box::new(|ops: &[Operation]| prompt(&format!("Execute {} operation(s)?", ops.len())))
    };
    let report = execute(
        &plan,
        backend,
        ExecuteOptions {
            dry_run: false,
            confirm: Some(confirm),
        },
    )
    .await?;

    if report.aborted {
        println!("aborted");
        return Ok(1);
    }
    println!("{} operation(s) executed", report.count());
    for failure in &report.failures {
        eprintln!("error: {}", failure);
    }
    Ok(if report.failures.is_empty() { 0 } else { 1 })
}

// ── zk ───────────────────────────────────────────────────────────────────────

pub async fn zk(endpoints: &Endpoints, command: ZkCommand) -> Result<u8> {
    let api = inventory(endpoints)?;
    let snap = snapshot(endpoints, &api).await?;
    let config = RingConfig::default();

    match command {
        ZkCommand::List => {
            let report = audit(&snap, &config)?;
            print!("{}", output::render_ring_audit(&report));
            Ok(0)
        }
        ZkCommand::Fixup { dry_run, confirm } => {
            let report = audit(&snap, &config)?;
            print!("{}", output::render_ring_audit(&report));
            if !report.validation_errors.is_empty() {
                eprintln!("ring has problems repair cannot fix");
                return Ok(1);
            }
            if report.missing_instances.is_empty() {
                println!("nothing to repair");
                return Ok(0);
            }
            if !dry_run
                && !confirm
                && !prompt(&format!(
                    "Remove {} entry(ies)?",
                    report.missing_instances.len()
                ))
            {
                println!("aborted");
                return Ok(1);
            }
            let fixed = repair(&api, &snap, &config, dry_run).await?;
            if dry_run {
                println!("would remove ordinal(s) {:?}", fixed.removed);
            } else {
                println!("removed ordinal(s) {:?}", fixed.removed);
            }
            Ok(0)
        }
    }
}

// ── alarm ────────────────────────────────────────────────────────────────────

pub async fn alarm(endpoints: &Endpoints, command: AlarmCommand) -> Result<u8> {
    let api = inventory(endpoints)?;
    let monitor = monitor(endpoints)?;
    let snap = snapshot(endpoints, &api).await?;
    let account = snap.application.owner_account.clone();

    match command {
        AlarmCommand::Show => {
            let alarms = monitor.list_alarms(&account, true).await?;
            println!("{} open alarm(s)", alarms.len());
            let groups = monitor.list_probe_groups(&account).await?;
            print!("{}", output::render_alarms(&alarms, &groups));
            Ok(0)
        }
        AlarmCommand::List => {
            let alarms = monitor.list_alarms(&account, true).await?;
            let groups = monitor.list_probe_groups(&account).await?;
            print!("{}", output::render_alarms(&alarms, &groups));
            Ok(0)
        }
        AlarmCommand::Details { ids } | AlarmCommand::Faults { ids } => {
            let mut failed = false;
            for id in ids {
                match monitor.get_alarm(&account, id).await? {
                    Some(alarm) => print!("{}", output::render_alarm_details(&alarm)),
                    None => {
                        eprintln!("error: alarm {} not found", id);
                        failed = true;
                    }
                }
            }
            Ok(if failed { 1 } else { 0 })
        }
        AlarmCommand::Close { ids } => {
            let mut errors = 0;
            for id in ids {
                if let Err(err) = monitor.close_alarm(&account, id).await {
                    eprintln!("error: alarm {}: {}", id, err);
                    errors += 1;
                }
            }
            Ok(if errors > 0 { 1 } else { 0 })
        }
        AlarmCommand::Notify { mode, ids } => {
            let enabled = matches!(mode, NotifyMode::On);
            let mut errors = 0;
            for id in ids {
                if let Err(err) = monitor.set_alarm_notification(&account, id, enabled).await {
                    eprintln!("error: alarm {}: {}", id, err);
                    errors += 1;
                }
            }
            Ok(if errors > 0 { 1 } else { 0 })
        }
        AlarmCommand::Config { command } => {
            alarm_config(&api, &monitor, &snap, &account, command).await
        }
        AlarmCommand::Maint { command } => alarm_maint(&monitor, &account, command).await,
    }
}

async fn alarm_config(
    api: &HttpInventory,
    monitor: &HttpMonitor,
    snap: &FleetSnapshot,
    account: &str,
    command: AlarmConfigCommand,
) -> Result<u8> {
    let contacts: Vec<String> = ALARM_CONTACTS.iter().map(|c| c.to_string()).collect();
    match command {
        AlarmConfigCommand::Show => {
            let deployed = shoal_alarm::load_deployed(monitor, api, snap, 10).await?;
            println!(
                "{} probe group(s), {} probe(s) deployed",
                deployed.groups.len(),
                deployed.probes.len()
            );
            for group in &deployed.groups {
                let count = deployed
                    .probes
                    .iter()
                    .filter(|p| p.group_id == group.uuid)
                    .count();
                println!("    {} ({} probe(s))", group.name, count);
            }
            Ok(0)
        }
        AlarmConfigCommand::Verify => {
            let wanted = compute_wanted(snap, &event_catalog(), &contacts)?;
            let deployed = shoal_alarm::load_deployed(monitor, api, snap, 10).await?;
            let plan = build_update_plan(&wanted, &deployed);
            print!("{}", output::render_alarm_plan(&plan));
            Ok(0)
        }
        AlarmConfigCommand::Update { unconfigure } => {
            let wanted = if unconfigure {
                Vec::new()
            } else {
                compute_wanted(snap, &event_catalog(), &contacts)?
            };
            let deployed = shoal_alarm::load_deployed(monitor, api, snap, 10).await?;
            let plan = build_update_plan(&wanted, &deployed);
            print!("{}", output::render_alarm_plan(&plan));
            if plan.has_no_changes() {
                return Ok(0);
            }
            let summary = apply_plan(
                Arc::new(monitor.clone()),
                &plan,
                &ApplyOptions::new(account),
            )
            .await?;
            println!("{} change(s) applied", summary.changed());
            for error in &summary.errors {
                eprintln!("error: {}", error);
            }
            Ok(if summary.errors.is_empty() { 0 } else { 1 })
        }
    }
}

async fn alarm_maint(monitor: &HttpMonitor, account: &str, command: MaintCommand) -> Result<u8> {
    match command {
        MaintCommand::Create {
            start,
            end,
            notes,
            probes,
            probegroups,
            machines,
        } => {
            let scope = match (!probes.is_empty(), !probegroups.is_empty(), !machines.is_empty()) {
                (true, false, false) => MaintScope::Probes(probes),
                (false, true, false) => MaintScope::ProbeGroups(probegroups),
                (false, false, true) => MaintScope::Machines(machines),
                (false, false, false) => MaintScope::All,
                _ => bail!(UsageError(
                    "--probe, --probegroup, and --machine are mutually exclusive".to_string()
                )),
            };
            let window = NewMaintWindow {
                start: parse_time(&start)?,
                end: parse_time(&end)?,
                notes,
                scope,
            };
            let created = create_window(monitor, account, &window).await?;
            println!("created maintenance window {}", created.id);
            Ok(0)
        }
        MaintCommand::Delete { ids } => {
            let mut errors = 0;
            for id in ids {
                if let Err(err) = monitor.delete_maintenance_window(account, id).await {
                    eprintln!("error: window {}: {}", id, err);
                    errors += 1;
                }
            }
            Ok(if errors > 0 { 1 } else { 0 })
        }
        MaintCommand::List | MaintCommand::Show => {
            let windows = monitor.list_maintenance_windows(account).await?;
            print!("{}", output::render_maint_windows(&windows));
            Ok(0)
        }
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("unparsable time '{}' (expected RFC 3339)", text))
}

// ── fleet ────────────────────────────────────────────────────────────────────

pub async fn fleet(endpoints: &Endpoints, args: FleetArgs) -> Result<u8> {
    let api = inventory(endpoints)?;
    let snap = snapshot(endpoints, &api).await?;

    let scope = Scope {
        instances: args.instances,
        services: args.services,
        computes: args.computes,
        all_instances: args.all_zones,
        global_zones: args.global_zones,
    };
    let targets = resolve_scope(&snap, &scope)?;
    if targets.is_empty() {
        eprintln!("scope selected no targets");
        return Ok(0);
    }
    debug!(targets = targets.len(), "fleet scope resolved");

    let operation = match (args.command, args.get, args.put, args.dir) {
        (Some(command), None, None, _) => FleetOperation::Command(command),
        (None, Some(remote_path), None, Some(local_dir)) => FleetOperation::Get {
            remote_path,
            local_dir,
        },
        (None, None, Some(local_path), Some(remote_dir)) => FleetOperation::Put {
            local_path,
            remote_dir,
        },
        _ => bail!(UsageError(
            "specify a command, or --get/--put with --dir".to_string()
        )),
    };

    let transport = AmqpTransport::connect(&AmqpConfig {
        host: endpoints.amqp_host.clone(),
        port: endpoints.amqp_port,
        login: endpoints.amqp_login.clone(),
        password: endpoints.amqp_password.clone(),
        connect_timeout: Duration::from_secs(10),
    })
    .await?;

    // Interrupt stops scheduling new operations; in-flight ones run to
    // their deadlines.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let dispatcher = Dispatcher::new(Arc::new(transport));
    let opts = DispatchOptions {
        concurrency: args.concurrency,
        exec_timeout: Duration::from_secs(args.timeout),
    };
    let rx = dispatcher.run(targets, operation, &opts, cancel_rx).await?;

    let format = if args.json {
        OutputFormat::Json
    } else if args.oneline {
        OutputFormat::Text(TextMode::Oneline)
    } else if args.multiline {
        OutputFormat::Text(TextMode::Multiline)
    } else {
        OutputFormat::Text(TextMode::Auto)
    };
    let mut stdout = io::stdout();
    let summary = consume(rx, format, args.immediate, &mut stdout).await?;

    Ok(if summary.failures > 0 { 1 } else { 0 })
}
