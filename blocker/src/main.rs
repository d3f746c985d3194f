// ABOUTME: provides the blocker cli for switching components, applications and intent firewall rules.
// ABOUTME: prints deterministic json on stdout and logs to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use blocker::config::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_SERVICE_DIR};
use blocker::exec::ShellConfig;
use blocker::ifw::RuleFile;
use blocker::pm::{user_id_for_uid, PmTools};
use blocker::{switch_report, Backend, Blocker, BlockerConfig, ControlError, SwitchReport};
use blocker_common::{validate_identity, ComponentCategory, ComponentIdentity, ComponentState, SERVICE_NAME};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "blocker")]
struct Args {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, ClapArgs)]
struct Options {
    #[arg(long, env = "BLOCKER_SU", default_value = "su")]
    su_program: String,

    #[arg(long, env = "BLOCKER_PM", default_value = "pm")]
    pm_program: String,

    #[arg(long, env = "BLOCKER_DUMPSYS", default_value = "dumpsys")]
    dumpsys_program: String,

    #[arg(long, env = "BLOCKER_GETPROP", default_value = "getprop")]
    getprop_program: String,

    #[arg(long, env = "BLOCKER_SERVICE_DIR", default_value = DEFAULT_SERVICE_DIR)]
    service_dir: PathBuf,

    #[arg(long, env = "BLOCKER_SERVICE_NAME", default_value = SERVICE_NAME)]
    service_name: String,

    #[arg(long, env = "BLOCKER_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Android user to act for; defaults to the user owning this process.
    #[arg(long, env = "BLOCKER_USER")]
    user: Option<u32>,

    #[arg(long, env = "BLOCKER_COMMAND_TIMEOUT_SEC", default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs())]
    command_timeout_sec: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Switches one or more components of a package, one report line each.
    Switch {
        #[arg(long)]
        package: String,

        #[arg(long = "component", required = true)]
        components: Vec<String>,

        #[arg(long, value_enum)]
        state: StateArg,

        #[arg(long, value_enum, env = "BLOCKER_BACKEND", default_value_t = Backend::Auto)]
        backend: Backend,
    },
    State {
        #[arg(long)]
        package: String,

        #[arg(long)]
        component: String,

        #[arg(long, value_enum, env = "BLOCKER_BACKEND", default_value_t = Backend::Auto)]
        backend: Backend,
    },
    App {
        #[command(subcommand)]
        command: AppCommand,
    },
    Ifw {
        #[command(subcommand)]
        command: IfwCommand,
    },
    Paths,
}

#[derive(Debug, Subcommand)]
enum AppCommand {
    Enable {
        #[arg(long)]
        package: String,
    },
    Disable {
        #[arg(long)]
        package: String,
    },
    State {
        #[arg(long)]
        package: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum IfwCommand {
    Add {
        #[arg(long)]
        package: String,

        #[arg(long = "component", required = true)]
        components: Vec<String>,

        #[arg(long, value_enum)]
        category: CategoryArg,
    },
    Remove {
        #[arg(long)]
        package: String,

        #[arg(long = "component", required = true)]
        components: Vec<String>,

        #[arg(long, value_enum)]
        category: CategoryArg,
    },
    Status {
        #[arg(long)]
        package: String,

        #[arg(long)]
        component: String,
    },
    Show {
        #[arg(long)]
        package: String,
    },
    Clear {
        #[arg(long)]
        package: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Enabled,
    Disabled,
    Default,
}

impl From<StateArg> for ComponentState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Enabled => ComponentState::Enabled,
            StateArg::Disabled => ComponentState::Disabled,
            StateArg::Default => ComponentState::Default,
        }
    }
}

/// Providers are left out: ifw rules cannot cover them.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CategoryArg {
    Activity,
    #[value(alias = "broadcast")]
    Receiver,
    Service,
}

impl From<CategoryArg> for ComponentCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Activity => ComponentCategory::Activity,
            CategoryArg::Receiver => ComponentCategory::Receiver,
            CategoryArg::Service => ComponentCategory::Service,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing();

    let backend = match &args.command {
        Command::Switch { backend, .. } | Command::State { backend, .. } => *backend,
        _ => Backend::Auto,
    };
    let blocker = Blocker::new(build_config(&args.options, backend)).context("start blocker runtime")?;

    match args.command {
        Command::Switch {
            package,
            components,
            state,
            ..
        } => {
            let reports = switch_all(&blocker, &package, &components, ComponentState::from(state));
            for report in &reports {
                println!("{}", serde_json::to_string(report)?);
            }
            if reports.iter().any(|report| !report.ok) {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::State { package, component, .. } => {
            let enabled = blocker
                .check_component_enable_state(&package, &component)
                .with_context(|| format!("query {package}/{component}"))?;
            print_json(&json!({
                "package_name": package,
                "component_name": component,
                "enabled": enabled,
            }))?;
        }
        Command::App { command } => {
            if !run_app(&blocker, command)? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Ifw { command } => run_ifw(&blocker, command)?,
        Command::Paths => {
            let paths = blocker.paths();
            print_json(&json!({ "ifw_folder": paths.ifw_folder() }))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// A single component goes through `switch_component`; several go through
/// the batch path so a failure in one does not stop the rest.
fn switch_all(blocker: &Blocker, package: &str, components: &[String], state: ComponentState) -> Vec<SwitchReport> {
    let controller = match blocker.controller() {
        Ok(controller) => controller,
        Err(err) => {
            let outcome = Err(err);
            return components
                .iter()
                .map(|component| switch_report(package, component, state, None, &outcome))
                .collect();
        }
    };
    let selected = Some(controller.backend());

    if let [component] = components {
        let outcome = controller.switch_component(package, component, state);
        return vec![switch_report(package, component, state, selected, &outcome)];
    }

    let identities: Vec<ComponentIdentity> = components
        .iter()
        .map(|component| ComponentIdentity::new(package, component.as_str()))
        .collect();
    let mut reports = Vec::with_capacity(identities.len());
    let mut record = |component: &ComponentIdentity, outcome: &Result<bool, ControlError>| {
        reports.push(switch_report(
            &component.package_name,
            &component.component_name,
            state,
            selected,
            outcome,
        ));
    };
    match state {
        ComponentState::Enabled => {
            controller.batch_enable(&identities, &mut record);
        }
        ComponentState::Disabled => {
            controller.batch_disable(&identities, &mut record);
        }
        ComponentState::Default => {
            for component in &identities {
                let outcome = controller.switch_component(&component.package_name, &component.component_name, state);
                record(component, &outcome);
            }
        }
    }
    reports
}

/// Returns false when a switch was refused.
fn run_app(blocker: &Blocker, command: AppCommand) -> anyhow::Result<bool> {
    let apps = blocker.apps();
    match command {
        AppCommand::Enable { package } => {
            let switched = apps.enable(&package).with_context(|| format!("enable {package}"))?;
            print_json(&json!({ "package_name": package, "state": ComponentState::Enabled, "switched": switched }))?;
            Ok(switched)
        }
        AppCommand::Disable { package } => {
            let switched = apps.disable(&package).with_context(|| format!("disable {package}"))?;
            print_json(&json!({ "package_name": package, "state": ComponentState::Disabled, "switched": switched }))?;
            Ok(switched)
        }
        AppCommand::State { package } => {
            let enabled = apps.is_enabled(&package).with_context(|| format!("query {package}"))?;
            print_json(&json!({ "package_name": package, "enabled": enabled }))?;
            Ok(true)
        }
        AppCommand::List => {
            let packages = apps.installed_packages().context("list installed packages")?;
            print_json(&json!({ "packages": packages }))?;
            Ok(true)
        }
    }
}

fn run_ifw(blocker: &Blocker, command: IfwCommand) -> anyhow::Result<()> {
    let store = blocker.ifw();
    match command {
        IfwCommand::Add {
            package,
            components,
            category,
        } => {
            let category = ComponentCategory::from(category);
            let entries = rule_entries(&package, &components, category)?;
            let mut applied = Vec::new();
            let changed = store
                .add_all(&entries, |component| applied.push(component.component_name.clone()))
                .with_context(|| format!("block components of {package}"))?;
            print_json(&json!({
                "package_name": package,
                "components": applied,
                "category": category,
                "changed": changed,
            }))
        }
        IfwCommand::Remove {
            package,
            components,
            category,
        } => {
            let category = ComponentCategory::from(category);
            let entries = rule_entries(&package, &components, category)?;
            let mut applied = Vec::new();
            let changed = store
                .remove_all(&entries, |component| applied.push(component.component_name.clone()))
                .with_context(|| format!("unblock components of {package}"))?;
            print_json(&json!({
                "package_name": package,
                "components": applied,
                "category": category,
                "changed": changed,
            }))
        }
        IfwCommand::Status { package, component } => {
            let enabled = store
                .get_component_enable_state(&package, &component)
                .with_context(|| format!("load rules for {package}"))?;
            print_json(&json!({
                "package_name": package,
                "component_name": component,
                "blocked": !enabled,
            }))
        }
        IfwCommand::Show { package } => {
            let shown = store
                .with_rules(&package, |file| Ok(describe(file)))
                .with_context(|| format!("load rules for {package}"))?;
            print_json(&shown)
        }
        IfwCommand::Clear { package } => {
            store
                .clear(&package)
                .with_context(|| format!("clear rules for {package}"))?;
            print_json(&json!({ "package_name": package, "cleared": true }))
        }
    }
}

fn rule_entries(
    package: &str,
    components: &[String],
    category: ComponentCategory,
) -> anyhow::Result<Vec<(ComponentIdentity, ComponentCategory)>> {
    components
        .iter()
        .map(|component| {
            validate_identity(package, component).map_err(|e| anyhow::anyhow!(e.message))?;
            Ok((ComponentIdentity::new(package, component.as_str()), category))
        })
        .collect()
}

fn describe(file: &RuleFile) -> serde_json::Value {
    let names = |category: ComponentCategory| -> Vec<String> {
        file.rules()
            .section(category)
            .map(|section| section.component_filters.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    };
    json!({
        "package_name": file.package_name(),
        "path": file.dest_path(),
        "activity": names(ComponentCategory::Activity),
        "broadcast": names(ComponentCategory::Receiver),
        "service": names(ComponentCategory::Service),
    })
}

fn build_config(options: &Options, backend: Backend) -> BlockerConfig {
    let timeout = Duration::from_secs(options.command_timeout_sec);
    let defaults = BlockerConfig::default();
    BlockerConfig {
        backend,
        shell: ShellConfig {
            program: options.su_program.clone(),
            ..ShellConfig::su(timeout)
        },
        pm: PmTools {
            pm: options.pm_program.clone(),
            dumpsys: options.dumpsys_program.clone(),
            timeout,
            ..PmTools::default()
        },
        getprop: options.getprop_program.clone(),
        service_dir: options.service_dir.clone(),
        service_name: options.service_name.clone(),
        staging_dir: options.staging_dir.clone().unwrap_or(defaults.staging_dir),
        user_id: options
            .user
            .unwrap_or_else(|| user_id_for_uid(unsafe { libc::geteuid() })),
        command_timeout: timeout,
    }
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_takes_several_components() {
        let args = Args::try_parse_from([
            "blocker",
            "switch",
            "--package",
            "com.example.app",
            "--component",
            "MainActivity",
            "--component",
            "SyncService",
            "--state",
            "disabled",
        ])
        .unwrap();
        match args.command {
            Command::Switch { components, backend, .. } => {
                assert_eq!(components, vec!["MainActivity", "SyncService"]);
                assert_eq!(backend, Backend::Auto);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn state_and_app_commands_parse() {
        let args = Args::try_parse_from([
            "blocker",
            "state",
            "--package",
            "com.example.app",
            "--component",
            "MainActivity",
            "--backend",
            "combined",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::State { backend: Backend::Combined, .. }));

        let args = Args::try_parse_from(["blocker", "app", "disable", "--package", "com.example.app"]).unwrap();
        assert!(matches!(
            args.command,
            Command::App { command: AppCommand::Disable { ref package } } if package == "com.example.app"
        ));
        assert!(Args::try_parse_from(["blocker", "switch", "--package", "p", "--state", "enabled"]).is_err());
    }

    #[test]
    fn rule_entries_reject_any_invalid_component() {
        let components = vec!["MainActivity".to_string(), "x/Evil".to_string()];
        assert!(rule_entries("com.example.app", &components, ComponentCategory::Activity).is_err());

        let entries = rule_entries("com.example.app", &components[..1], ComponentCategory::Receiver).unwrap();
        assert_eq!(
            entries,
            vec![(ComponentIdentity::new("com.example.app", "MainActivity"), ComponentCategory::Receiver)]
        );
    }
}
