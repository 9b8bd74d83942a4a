use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "shoal",
    about = "Fleet administration for the shoal object store",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub endpoints: Endpoints,

    #[command(subcommand)]
    pub command: Command,
}

/// Upstream endpoints and credentials, usually taken from the environment.
#[derive(Debug, Clone, Args)]
pub struct Endpoints {
    /// Application/service registry base URL.
    #[arg(long, env = "SHOAL_REGISTRY_URL", default_value = "http://registry.shoal.local", global = true)]
    pub registry_url: String,

    /// VM inventory base URL.
    #[arg(long, env = "SHOAL_VMS_URL", default_value = "http://vms.shoal.local", global = true)]
    pub vms_url: String,

    /// Compute-node inventory base URL.
    #[arg(long, env = "SHOAL_CN_URL", default_value = "http://cn.shoal.local", global = true)]
    pub cn_url: String,

    /// Image registry base URL.
    #[arg(long, env = "SHOAL_IMAGES_URL", default_value = "http://images.shoal.local", global = true)]
    pub images_url: String,

    /// Monitoring service base URL.
    #[arg(long, env = "SHOAL_MONITOR_URL", default_value = "http://monitor.shoal.local", global = true)]
    pub monitor_url: String,

    /// Well-known name of the fleet application.
    #[arg(long, env = "SHOAL_APPLICATION", default_value = "shoal", global = true)]
    pub application: String,

    #[arg(long, env = "SHOAL_AMQP_HOST", default_value = "localhost", global = true)]
    pub amqp_host: String,

    #[arg(long, env = "SHOAL_AMQP_PORT", default_value_t = 5672, global = true)]
    pub amqp_port: u16,

    #[arg(long, env = "SHOAL_AMQP_LOGIN", default_value = "guest", global = true)]
    pub amqp_login: String,

    #[arg(long, env = "SHOAL_AMQP_PASSWORD", default_value = "guest", global = true)]
    pub amqp_password: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show deployed service instances.
    Show {
        /// Restrict to one service.
        service: Option<String>,

        /// Counts per (service, shard, image) instead of per instance.
        #[arg(short = 's', long)]
        summary: bool,

        /// Group output by compute node.
        #[arg(long)]
        bycn: bool,

        /// Emit the observed layout as JSON (usable as an update input).
        #[arg(short = 'j', long)]
        json: bool,

        /// Include instances in other datacenters.
        #[arg(short = 'a', long)]
        all: bool,
    },

    /// Show compute nodes hosting the fleet.
    Cn {
        /// Substring filter on hostname or compute id.
        filter: Option<String>,

        /// Only storage nodes.
        #[arg(short = 's', long)]
        storage_only: bool,

        /// Omit the header row.
        #[arg(short = 'n', long)]
        no_header: bool,

        /// Comma-separated column list.
        #[arg(short = 'o', long, value_delimiter = ',')]
        columns: Vec<String>,
    },

    /// Generate a desired-layout file.
    Genconfig {
        /// Built-in deployment template.
        #[arg(value_enum)]
        template: Option<TemplateArg>,

        /// Generate from a hardware description instead of a template.
        #[arg(long, conflicts_with = "template")]
        from_file: Option<PathBuf>,

        /// Directory for per-availability-zone layout files.
        #[arg(long)]
        directory: Option<PathBuf>,
    },

    /// Reconcile the fleet against a desired layout.
    Update {
        /// Desired layout file.
        path: PathBuf,

        /// Restrict changes to one service.
        service: Option<String>,

        /// Plan and print without executing.
        #[arg(long)]
        dry_run: bool,

        /// Skip the interactive confirmation.
        #[arg(short = 'y', long)]
        confirm: bool,

        /// Expand image changes into provision/deprovision pairs.
        #[arg(long)]
        no_reprovision: bool,
    },

    /// Inspect and repair the coordination ring.
    Zk {
        #[command(subcommand)]
        command: ZkCommand,
    },

    /// Alarms and monitoring configuration.
    Alarm {
        #[command(subcommand)]
        command: AlarmCommand,
    },

    /// Run a command or transfer files across the fleet.
    Fleet(FleetArgs),
}

#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateArg {
    Standalone,
    Development,
}

#[derive(Debug, Subcommand)]
pub enum ZkCommand {
    /// Show the stored ring and its audit.
    List,
    /// Remove ring entries whose instance no longer exists.
    Fixup {
        #[arg(long)]
        dry_run: bool,

        /// Skip the interactive confirmation.
        #[arg(short = 'y', long)]
        confirm: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum AlarmCommand {
    /// Summarise open alarms.
    Show,
    /// List open alarms.
    List,
    /// Full details for the given alarms.
    Details { ids: Vec<u64> },
    /// Fault records for the given alarms.
    Faults { ids: Vec<u64> },
    /// Close the given alarms.
    Close { ids: Vec<u64> },
    /// Toggle per-alarm notifications.
    Notify {
        #[arg(value_enum)]
        mode: NotifyMode,
        ids: Vec<u64>,
    },
    /// Probe configuration.
    Config {
        #[command(subcommand)]
        command: AlarmConfigCommand,
    },
    /// Maintenance windows.
    Maint {
        #[command(subcommand)]
        command: MaintCommand,
    },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum NotifyMode {
    On,
    Off,
}

#[derive(Debug, Subcommand)]
pub enum AlarmConfigCommand {
    /// Show the deployed probe configuration.
    Show,
    /// Compare deployed configuration against the expected set.
    Verify,
    /// Bring deployed configuration up to date.
    Update {
        /// Remove everything this toolkit manages instead.
        #[arg(long)]
        unconfigure: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum MaintCommand {
    /// Create a maintenance window.
    Create {
        /// Window start, RFC 3339.
        #[arg(long)]
        start: String,

        /// Window end, RFC 3339.
        #[arg(long)]
        end: String,

        #[arg(long)]
        notes: String,

        /// Limit to specific probes.
        #[arg(long = "probe")]
        probes: Vec<String>,

        /// Limit to specific probe groups.
        #[arg(long = "probegroup")]
        probegroups: Vec<String>,

        /// Limit to specific machines.
        #[arg(long = "machine")]
        machines: Vec<String>,
    },
    Delete { ids: Vec<u64> },
    List,
    Show,
}

#[derive(Debug, Args)]
pub struct FleetArgs {
    /// Shell command to run on each target.
    #[arg(
        required_unless_present_any = ["get", "put"],
        conflicts_with_all = ["get", "put"]
    )]
    pub command: Option<String>,

    /// Target specific instances.
    #[arg(short = 'z', long = "instance")]
    pub instances: Vec<String>,

    /// Target all local instances of a service.
    #[arg(short = 's', long = "service")]
    pub services: Vec<String>,

    /// Target all instances on a compute node (hostname or id).
    #[arg(short = 'S', long = "compute")]
    pub computes: Vec<String>,

    /// Target every local instance.
    #[arg(short = 'a', long)]
    pub all_zones: bool,

    /// Target global zones instead of instances.
    #[arg(short = 'G', long)]
    pub global_zones: bool,

    /// Fetch this remote file from each target (requires --dir).
    #[arg(short = 'g', long, requires = "dir")]
    pub get: Option<PathBuf>,

    /// Push this local file to each target (requires --dir).
    #[arg(short = 'p', long, requires = "dir", conflicts_with = "get")]
    pub put: Option<PathBuf>,

    /// Local destination directory (get) or remote directory (put).
    #[arg(short = 'd', long)]
    pub dir: Option<PathBuf>,

    /// Maximum simultaneously outstanding operations.
    #[arg(short = 'c', long, default_value_t = 30)]
    pub concurrency: usize,

    /// Per-target timeout in seconds.
    #[arg(short = 'T', long, default_value_t = 60)]
    pub timeout: u64,

    /// Emit results as they complete instead of at the end.
    #[arg(short = 'I', long)]
    pub immediate: bool,

    /// One JSON object per result.
    #[arg(short = 'J', long)]
    pub json: bool,

    /// Force one line per result.
    #[arg(short = 'N', long, conflicts_with = "json")]
    pub oneline: bool,

    /// Force full output per result.
    #[arg(long, conflicts_with_all = ["json", "oneline"])]
    pub multiline: bool,
}
