mod hotplug;
mod property;
mod record;
mod topology;

use clap::{Args, Parser, Subcommand};
use pwrcfg::config::AppConfig;
use pwrcfg::engine::CancelToken;
use pwrcfg::host::{HostSpec, RemoteConfig};
use pwrcfg::selection::SelectionRequest;
use pwrcfg::session::{EngineOptions, HostSession};
use pwrcfg::topology::Order;
use pwrcfg::util::error::AppError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    pub host: HostArgs,

    /// Print debug messages
    #[clap(short, long, global = true)]
    pub debug: bool,

    /// Scope instances to resolve in parallel, 0 for one per local CPU
    #[clap(short, long, global = true)]
    pub jobs: Option<usize>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Default)]
pub struct HostArgs {
    /// Operate on a remote host over SSH
    #[clap(short = 'H', long, global = true)]
    pub hostname: Option<String>,

    /// User name for the remote host
    #[clap(short = 'U', long, global = true)]
    pub username: Option<String>,

    /// Private key for the remote host
    #[clap(short = 'K', long = "priv-key", global = true)]
    pub private_key: Option<PathBuf>,

    /// Remote connect and operation timeout in seconds
    #[clap(short = 'T', long, global = true)]
    pub timeout: Option<u64>,

    /// Operate on a recorded dataset instead of a live host
    #[clap(short = 'D', long, global = true)]
    pub dataset: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Read properties
    Get {
        /// Property names, see `props`
        #[clap(required = true)]
        properties: Vec<String>,
        #[clap(flatten)]
        select: SelectArgs,
        /// Mechanisms to try, in order, such as `msr,sysfs`
        #[clap(long)]
        mechanisms: Option<String>,
    },
    /// Change properties
    Set {
        /// Assignments such as `max_freq=2.4GHz` or `uncore_max_freq=mdl`
        #[clap(required = true, value_name = "PROP=VALUE")]
        assignments: Vec<String>,
        #[clap(flatten)]
        select: SelectArgs,
        /// Mechanisms to try, in order, such as `msr,sysfs`
        #[clap(long)]
        mechanisms: Option<String>,
        /// Read the value back on every affected CPU
        #[clap(long)]
        verify: bool,
    },
    /// Show how CPUs are arranged into cores, modules, dies and packages
    Topology {
        #[clap(flatten)]
        select: SelectArgs,
    },
    /// List the known properties
    Props,
    /// Bring CPUs online, take them offline or show their state
    CpuHotplug {
        #[clap(subcommand)]
        action: HotplugAction,
    },
    /// Capture everything readable into a dataset usable with `-D`
    Record {
        /// Where to write the dataset
        #[clap(short, long)]
        output: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum HotplugAction {
    /// Bring CPUs online
    Online {
        /// CPUs to bring online, such as `4-7` or `all`
        #[clap(long)]
        cpus: String,
    },
    /// Take CPUs offline
    Offline {
        #[clap(flatten)]
        select: SelectArgs,
    },
    /// Show online and offline CPUs
    Info,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SelectArgs {
    /// CPU numbers, such as `0-3,8` or `all`
    #[clap(long)]
    pub cpus: Option<String>,
    /// Core numbers, relative to the package
    #[clap(long)]
    pub cores: Option<String>,
    /// Module numbers
    #[clap(long)]
    pub modules: Option<String>,
    /// Die numbers
    #[clap(long)]
    pub dies: Option<String>,
    /// Package numbers
    #[clap(long)]
    pub packages: Option<String>,
    /// Keep only CPUs at these positions among the online CPUs of their core
    #[clap(long)]
    pub core_siblings: Option<String>,
    /// Keep only CPUs at these positions among the online CPUs of their module
    #[clap(long)]
    pub module_siblings: Option<String>,
    /// The package core and die numbers refer to
    #[clap(long)]
    pub package: Option<u32>,
    /// Order to list CPUs in
    #[clap(long, value_enum, default_value_t)]
    pub order: Order,
}

impl SelectArgs {
    pub fn request(&self, default_all: bool) -> SelectionRequest {
        SelectionRequest {
            cpus: self.cpus.clone(),
            cores: self.cores.clone(),
            modules: self.modules.clone(),
            dies: self.dies.clone(),
            packages: self.packages.clone(),
            core_siblings: self.core_siblings.clone(),
            module_siblings: self.module_siblings.clone(),
            package: self.package,
            default_all,
        }
    }

    fn is_empty(&self) -> bool {
        self.request(false) == SelectionRequest::default()
    }
}

impl HostArgs {
    /// Command line values first, then the configuration file.
    pub fn spec(&self, config: &AppConfig) -> Result<HostSpec, AppError> {
        if let Some(dataset) = &self.dataset {
            if self.hostname.is_some() {
                return Err(AppError::Generic(
                    "--dataset and --hostname cannot be used together".to_string(),
                ));
            }
            return Ok(HostSpec::Dataset(dataset.clone()));
        }

        let remote = match &self.hostname {
            Some(hostname) => {
                let mut remote = RemoteConfig::new(hostname.clone());
                remote.username.clone_from(&config.remote.username);
                remote.private_key.clone_from(&config.remote.private_key);
                remote.timeout = config.remote.timeout;
                Some(remote)
            }
            None => config.remote.to_remote_config(),
        };

        let Some(mut remote) = remote else {
            if self.username.is_some() || self.private_key.is_some() {
                return Err(AppError::Generic(
                    "--username and --priv-key need --hostname".to_string(),
                ));
            }
            return Ok(HostSpec::Local);
        };

        if let Some(username) = &self.username {
            remote.username = Some(username.clone());
        }
        if let Some(key) = &self.private_key {
            remote.private_key = Some(key.clone());
        }
        if let Some(timeout) = self.timeout {
            remote.timeout = Duration::from_secs(timeout.max(1));
        }
        Ok(HostSpec::Remote(remote))
    }
}

pub fn run(cli: Cli, config: &AppConfig, cancel: CancelToken) -> Result<(), AppError> {
    let spec = cli.host.spec(config)?;
    let verify = matches!(cli.command, Commands::Set { verify: true, .. })
        || config.resolution.verify_writes;
    let options = EngineOptions {
        jobs: cli.jobs.unwrap_or(config.resolution.jobs),
        verify,
        cancel,
    };
    let open = || -> Result<HostSession, AppError> {
        Ok(HostSession::open(&spec)?.with_options(options.clone()))
    };
    let default_all = config.resolution.default_all_cpus;

    match cli.command {
        Commands::Get {
            properties,
            select,
            mechanisms,
        } => property::get(
            &open()?,
            &properties,
            &select.request(default_all),
            select.order,
            mechanisms.as_deref(),
        ),
        Commands::Set {
            assignments,
            select,
            mechanisms,
            ..
        } => property::set(
            &open()?,
            &assignments,
            &select.request(default_all),
            select.order,
            mechanisms.as_deref(),
        ),
        Commands::Topology { select } => {
            topology::show(&open()?, &select.request(true), select.order)
        }
        Commands::Props => {
            property::list();
            Ok(())
        }
        Commands::CpuHotplug { action } => match action {
            HotplugAction::Online { cpus } => hotplug::online(&mut open()?, &cpus),
            HotplugAction::Offline { select } => {
                if select.is_empty() {
                    return Err(AppError::Generic(
                        "specify the CPUs to take offline, for example --cpus 4-7".to_string(),
                    ));
                }
                hotplug::offline(&mut open()?, &select.request(false))
            }
            HotplugAction::Info => {
                hotplug::info(&open()?);
                Ok(())
            }
        },
        Commands::Record { output } => record::run(&spec, &output),
    }
}
