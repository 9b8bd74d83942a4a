use std::collections::BTreeMap;

use shoal_alarm::{Alarm, MaintWindow, ProbeGroup};
use shoal_domain::{catalog, ComputeId};
use shoal_inventory::FleetSnapshot;
use shoal_layout::DesiredLayout;
use shoal_ring::RingAudit;

/// Per-instance listing: SERVICE SHARD ZONENAME VERSION.
pub fn render_instances(
    snapshot: &FleetSnapshot,
    service: Option<&str>,
    include_remote: bool,
) -> String {
    let mut out = format!(
        "{:<16} {:>5} {:<38} {}\n",
        "SERVICE", "SHARD", "ZONENAME", "VERSION"
    );
    for inst in &snapshot.instances {
        if service.is_some_and(|s| s != inst.service.as_str()) {
            continue;
        }
        if !include_remote && !inst.is_local() {
            continue;
        }
        out.push_str(&format!(
            "{:<16} {:>5} {:<38} {}\n",
            inst.service,
            inst.shard.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            inst.instance_id,
            snapshot.image_version(&inst.image),
        ));
    }
    out
}

/// Count summary: SERVICE SHARD VERSION COUNT.
pub fn render_summary(snapshot: &FleetSnapshot, service: Option<&str>) -> String {
    let mut out = format!("{:<16} {:>5} {:<20} {}\n", "SERVICE", "SHARD", "VERSION", "COUNT");
    for name in catalog::all() {
        if service.is_some_and(|s| s != name) {
            continue;
        }
        let Some(counts) = snapshot.counts(name) else {
            continue;
        };
        for (config, count) in &counts.total {
            out.push_str(&format!(
                "{:<16} {:>5} {:<20} {}\n",
                name,
                config.shard().map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                snapshot.image_version(config.image()),
                count,
            ));
        }
    }
    out
}

/// Instances grouped under their hosting compute node.
pub fn render_by_compute(snapshot: &FleetSnapshot, service: Option<&str>) -> String {
    let mut grouped: BTreeMap<&ComputeId, Vec<&shoal_domain::Instance>> = BTreeMap::new();
    for inst in snapshot.local_instances() {
        if service.is_some_and(|s| s != inst.service.as_str()) {
            continue;
        }
        if let Some(compute) = &inst.host_compute {
            grouped.entry(compute).or_default().push(inst);
        }
    }

    let mut out = String::new();
    for (compute, instances) in grouped {
        let hostname = snapshot
            .compute_node(compute)
            .map(|cn| cn.hostname.as_str())
            .unwrap_or("-");
        out.push_str(&format!("CN {} ({})\n", hostname, compute));
        for inst in instances {
            out.push_str(&format!(
                "    {:<16} {:>5} {:<38} {}\n",
                inst.service,
                inst.shard.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                inst.instance_id,
                snapshot.image_version(&inst.image),
            ));
        }
    }
    out
}

/// The observed layout as JSON, shaped exactly like an update input.
pub fn render_layout_json(snapshot: &FleetSnapshot) -> Result<String, shoal_layout::LayoutError> {
    let mut layout = DesiredLayout::new();
    for name in catalog::all() {
        let Some(counts) = snapshot.counts(name) else {
            continue;
        };
        for (compute, configs) in &counts.per_compute {
            for (config, count) in configs {
                layout.set_count(compute.clone(), name, config.clone(), *count)?;
            }
        }
    }
    Ok(format!("{:#}\n", layout.to_json()))
}

pub const CN_COLUMNS: &[&str] = &["hostname", "uuid", "dc", "ram", "admin", "storage"];

/// Compute-node listing with a selectable column set.
pub fn render_compute_nodes(
    snapshot: &FleetSnapshot,
    filter: Option<&str>,
    storage_only: bool,
    no_header: bool,
    columns: &[String],
) -> Result<String, String> {
    let selected: Vec<&str> = if columns.is_empty() {
        CN_COLUMNS.to_vec()
    } else {
        let mut selected = Vec::with_capacity(columns.len());
        for column in columns {
            let Some(known) = CN_COLUMNS.iter().find(|c| **c == column.as_str()) else {
                return Err(format!("unknown column '{}'", column));
            };
            selected.push(*known);
        }
        selected
    };

    let mut out = String::new();
    if !no_header {
        for column in &selected {
            out.push_str(&format!("{:<width$} ", column.to_uppercase(), width = width(column)));
        }
        out.push('\n');
    }
    for cn in snapshot.compute_nodes.values() {
        if let Some(f) = filter {
            if !cn.hostname.contains(f) && !cn.compute_id.as_str().contains(f) {
                continue;
            }
        }
        if storage_only && !cn.is_storage_host {
            continue;
        }
        for column in &selected {
            let value = match *column {
                "hostname" => cn.hostname.clone(),
                "uuid" => cn.compute_id.to_string(),
                "dc" => cn.datacenter.clone(),
                "ram" => cn.ram.to_string(),
                "admin" => cn.admin_address.clone().unwrap_or_else(|| "-".to_string()),
                "storage" => if cn.is_storage_host { "yes" } else { "no" }.to_string(),
                _ => "-".to_string(),
            };
            out.push_str(&format!("{:<width$} ", value, width = width(column)));
        }
        out.push('\n');
    }
    Ok(out)
}

fn width(column: &str) -> usize {
    match column {
        "hostname" => 17,
        "uuid" => 38,
        "dc" => 10,
        "ram" => 8,
        "admin" => 16,
        _ => 7,
    }
}

// ── Plans and audits ─────────────────────────────────────────────────────────

pub fn render_plan(plan: &[shoal_deploy::Operation]) -> String {
    if plan.is_empty() {
        return "No changes.\n".to_string();
    }
    let mut out = String::new();
    for op in plan {
        out.push_str(&format!("{}\n", op));
    }
    out.push_str(&format!("{} operation(s)\n", plan.len()));
    out
}

pub fn render_ring_audit(audit: &RingAudit) -> String {
    let mut out = format!("{:<4} {:<16} {:>6} {}\n", "#", "ADDRESS", "PORT", "LAST");
    for entry in &audit.entries {
        out.push_str(&format!(
            "{:<4} {:<16} {:>6} {}\n",
            entry.ordinal,
            entry.address,
            entry.port,
            if entry.last { "yes" } else { "" },
        ));
    }
    for problem in &audit.validation_errors {
        out.push_str(&format!("problem: {}\n", problem));
    }
    for index in &audit.missing_instances {
        out.push_str(&format!(
            "repairable: entry {} has no backing instance\n",
            index
        ));
    }
    if audit.foreign_count > 0 {
        out.push_str(&format!(
            "{} entry(ies) served from another datacenter\n",
            audit.foreign_count
        ));
    }
    out
}

pub fn render_alarm_plan(plan: &shoal_alarm::AlarmUpdatePlan) -> String {
    if plan.has_no_changes() && plan.warnings.is_empty() {
        return "Alarm configuration is up to date.\n".to_string();
    }
    let mut out = String::new();
    for group in &plan.groups_to_add {
        out.push_str(&format!("+ group {}\n", group.name));
    }
    for group in &plan.groups_to_remove {
        out.push_str(&format!("- group {}\n", group.name));
    }
    for probe in &plan.probes_to_add {
        out.push_str(&format!("  + probe {} ({})\n", probe.probe.name, probe.group_name));
    }
    for probe in &plan.probes_to_remove {
        out.push_str(&format!("  - probe {} (agent {})\n", probe.name, probe.agent));
    }
    for warning in &plan.warnings {
        out.push_str(&format!("warning: {}\n", warning));
    }
    out
}

pub fn render_alarms(alarms: &[Alarm], groups: &[ProbeGroup]) -> String {
    let mut out = format!("{:<8} {:<6} {:<24} {}\n", "ALARM", "STATE", "OPENED", "GROUP");
    for alarm in alarms {
        let group_name = alarm
            .probe_group
            .as_deref()
            .and_then(|uuid| groups.iter().find(|g| g.uuid == uuid))
            .map(|g| g.name.as_str())
            .unwrap_or("-");
        out.push_str(&format!(
            "{:<8} {:<6} {:<24} {}\n",
            alarm.id,
            if alarm.closed { "closed" } else { "open" },
            alarm.time_opened.to_rfc3339(),
            group_name,
        ));
    }
    out
}

pub fn render_alarm_details(alarm: &Alarm) -> String {
    let mut out = format!(
        "alarm {}: {} (opened {}, notifications {})\n",
        alarm.id,
        if alarm.closed { "closed" } else { "open" },
        alarm.time_opened.to_rfc3339(),
        if alarm.suppressed { "off" } else { "on" },
    );
    for fault in &alarm.faults {
        out.push_str(&format!(
            "    {} {} {}\n",
            fault.time.to_rfc3339(),
            fault.event_class,
            fault.summary,
        ));
    }
    out
}

pub fn render_maint_windows(windows: &[MaintWindow]) -> String {
    let mut out = format!("{:<6} {:<25} {:<25} {}\n", "ID", "START", "END", "NOTES");
    for window in windows {
        out.push_str(&format!(
            "{:<6} {:<25} {:<25} {}\n",
            window.id,
            window.start.to_rfc3339(),
            window.end.to_rfc3339(),
            window.notes,
        ));
    }
    out
}
