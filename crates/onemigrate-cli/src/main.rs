//! onemigrate CLI - Move VMware VMs into OpenNebula.

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use onemigrate_core::config::{DEFAULT_SETTINGS_PATH, OPENNEBULA_AUTH_VAR};
use onemigrate_core::hypervisor::{filter_vms, Hypervisor, VsphereClient};
use onemigrate_core::opennebula::OpenNebulaClient;
use onemigrate_core::process::find_in_path;
use onemigrate_core::{
    MigrationJob, MigrationMode, Phase, PhaseStatus, Pipeline, PipelineEvent, PipelineReport,
    RegistryCredentials, Settings, SourceCredentials,
};

/// Migrate VMware virtual machine disks into an OpenNebula image datastore.
#[derive(Parser)]
#[command(name = "onemigrate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the settings document.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Suppress progress output.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the external tools and the registry are available.
    CheckEnv,

    /// List virtual machines on the source hypervisor.
    ListVms {
        /// Name filter: substring, or wildcard if it contains `*` or `?`.
        #[arg(short, long, default_value = "")]
        pattern: String,
    },

    /// Migrate one virtual machine.
    Migrate {
        /// Name of the VM on the source hypervisor.
        vm_name: String,

        /// Which phases to run.
        #[arg(short, long, value_enum, default_value = "full")]
        mode: ModeArg,
    },
}

/// Migration mode argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Export from vSphere, convert, then upload.
    Full,
    /// Convert and upload a disk already in the staging directory.
    Local,
    /// Report what would run without touching anything.
    DryRun,
}

impl From<ModeArg> for MigrationMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Full => MigrationMode::Full,
            ModeArg::Local => MigrationMode::Local,
            ModeArg::DryRun => MigrationMode::DryRun,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("cannot start without settings at {}", cli.config.display()))?;

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| settings.app.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    logging::init(&log_level);

    let auth = std::env::var(OPENNEBULA_AUTH_VAR).ok();

    match cli.command {
        Commands::CheckEnv => check_env(&settings, auth.as_deref()),
        Commands::ListVms { pattern } => list_vms(&settings, &pattern),
        Commands::Migrate { vm_name, mode } => {
            migrate(&settings, &vm_name, mode.into(), cli.quiet, auth.as_deref())
        }
    }
}

/// Exit status depends only on the conversion tool; everything else is advisory.
fn check_env(settings: &Settings, auth: Option<&str>) -> Result<()> {
    println!("Environment Check");
    println!("=================");

    let qemu_img = find_in_path(&settings.tools.qemu_img);
    print_tool(&settings.tools.qemu_img, qemu_img.as_deref(), true);

    let ovftool = find_in_path(&settings.tools.ovftool);
    print_tool(&settings.tools.ovftool, ovftool.as_deref(), false);

    println!("OpenNebula:  {}", registry_status(settings, auth));

    if qemu_img.is_none() {
        bail!("{} was not found on PATH", settings.tools.qemu_img);
    }
    Ok(())
}

fn registry_status(settings: &Settings, auth: Option<&str>) -> String {
    let credentials = match RegistryCredentials::from_value(auth) {
        Ok(Some(credentials)) => credentials,
        Ok(None) => return format!("not checked, {} is not set", OPENNEBULA_AUTH_VAR),
        Err(e) => return format!("not checked, {}", e),
    };
    let client = match OpenNebulaClient::new(&settings.opennebula) {
        Ok(client) => client,
        Err(e) => return format!("not checked, {}", e),
    };
    match client.version(&credentials) {
        Ok(version) => format!("reachable, version {} ({})", version, client.endpoint()),
        Err(e) => format!("unreachable at {}: {}", client.endpoint(), e),
    }
}

fn print_tool(name: &str, found: Option<&Path>, required: bool) {
    let label = format!("{}:", name);
    match found {
        Some(path) => println!("{:<12} found at {}", label, path.display()),
        None if required => println!("{:<12} MISSING (required)", label),
        None => println!("{:<12} missing (needed for full mode only)", label),
    }
}

fn list_vms(settings: &Settings, pattern: &str) -> Result<()> {
    let Some(vmware) = settings.vmware.as_ref() else {
        bail!("the settings document has no vmware section");
    };
    let Some(credentials) = SourceCredentials::from_settings(Some(vmware)) else {
        bail!("VMWARE_PASSWORD is not set");
    };

    let client = VsphereClient::new(credentials)?;
    let vms = filter_vms(client.list_vms().context("failed to list VMs")?, pattern);

    if vms.is_empty() {
        println!("No VMs match '{}'", pattern);
        return Ok(());
    }

    println!("{:<32} {:<12} {:>5} {:>12}", "NAME", "POWER", "CPUS", "MEMORY");
    for vm in &vms {
        let cpus = vm.cpu_count.map_or_else(|| "-".to_string(), |c| c.to_string());
        let memory = vm
            .memory_mib
            .map_or_else(|| "-".to_string(), |m| format_bytes(m * 1024 * 1024));
        println!("{:<32} {:<12} {:>5} {:>12}", vm.name, vm.power_state, cpus, memory);
    }
    println!();
    println!("{} VM(s)", vms.len());

    Ok(())
}

fn migrate(
    settings: &Settings,
    vm_name: &str,
    mode: MigrationMode,
    quiet: bool,
    auth: Option<&str>,
) -> Result<()> {
    let job = MigrationJob::new(vm_name, mode, &settings.app.staging_path)?;
    // A dry run never reaches Upload, so credentials are not looked at
    let registry_credentials = if mode.moves_data() {
        RegistryCredentials::from_value(auth)?
    } else {
        None
    };
    let source_credentials = SourceCredentials::from_settings(settings.vmware.as_ref());

    if !quiet {
        println!("VM Migration");
        println!("------------");
        println!("VM:        {}", job.vm_name());
        println!("Mode:      {}", job.mode());
        println!("Staging:   {}", job.staging_dir().display());
        println!("Datastore: {}", settings.opennebula.default_datastore_id);
        println!();
    }

    let mut pipeline = Pipeline::from_settings(settings, source_credentials, registry_credentials)?;

    let spinner = if quiet { None } else { Some(phase_spinner()?) };
    if let Some(pb) = spinner.clone() {
        pipeline = pipeline.with_progress(Box::new(move |event| render_event(&pb, event)));
    }

    let report = pipeline.run(&job)?;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    if !quiet {
        print_report(&report);
    }

    if let Some(failure) = &report.aborted {
        bail!("migration of {} aborted: {}", report.vm_name, failure);
    }

    let failed = report.failed_phases();
    if failed > 0 {
        println!("Migration of {} finished with {} failed phase(s)", report.vm_name, failed);
    } else if report.work_performed() {
        println!("Migration of {} completed successfully", report.vm_name);
    } else {
        println!("Dry run for {}: no work performed", report.vm_name);
    }

    Ok(())
}

fn phase_spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {prefix:.bold} {wide_msg}")?;
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

fn render_event(pb: &ProgressBar, event: PipelineEvent) {
    match event {
        PipelineEvent::PhaseStarted { phase } => {
            pb.set_prefix(phase.to_string());
            pb.set_message(match phase {
                Phase::Export => "Exporting from vSphere...",
                Phase::Convert => "Converting to qcow2...",
                Phase::Upload => "Registering image...",
            });
        }
        PipelineEvent::ToolOutput { line, .. } => pb.set_message(line),
        PipelineEvent::ArtifactLocated { artifact } => {
            pb.println(format!("Using staged disk {}", artifact.path.display()));
        }
        PipelineEvent::PhaseFinished { outcome } => {
            let line = match &outcome.status {
                PhaseStatus::Failed(failure) => format!("{:<8} failed: {}", outcome.phase, failure),
                status => format!("{:<8} {}", outcome.phase, status.label()),
            };
            pb.println(line);
        }
    }
}

fn print_report(report: &PipelineReport) {
    println!();
    println!("Summary");
    println!("-------");
    for outcome in &report.outcomes {
        let elapsed = if outcome.elapsed.is_zero() {
            String::new()
        } else {
            format!(" ({:.1}s)", outcome.elapsed.as_secs_f64())
        };
        println!("{:<8} {}{}", outcome.phase, outcome.status.label(), elapsed);
        if let Some(artifact) = &outcome.artifact {
            let size = std::fs::metadata(&artifact.path)
                .map(|m| format!(" [{}]", format_bytes(m.len())))
                .unwrap_or_default();
            println!("         {}{}", artifact.path.display(), size);
        }
    }
    if let Some(image) = &report.image {
        println!();
        println!(
            "Image:     {} (id {}, datastore {})",
            image.name, image.id, image.datastore_id
        );
    }
    println!();
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(qemu_img: &str, staging: &Path) -> Settings {
        let yaml = format!(
            "app:\n  staging_path: {}\ntools:\n  qemu_img: {}\nopennebula:\n  endpoint: http://127.0.0.1:9/RPC2\n  default_datastore_id: 1\n",
            staging.display(),
            qemu_img
        );
        Settings::from_yaml(&yaml).unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn test_check_env_ignores_malformed_registry_auth() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings("sh", dir.path());
        assert!(check_env(&settings, Some("oneadmin")).is_ok());
    }

    #[test]
    fn test_check_env_fails_without_conversion_tool() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings("onemigrate-no-such-qemu-img", dir.path());
        let err = check_env(&settings, None).unwrap_err();
        assert!(err.to_string().contains("onemigrate-no-such-qemu-img"));
    }

    #[test]
    fn test_registry_status_reports_malformed_auth() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings("qemu-img", dir.path());
        let status = registry_status(&settings, Some("oneadmin"));
        assert!(status.starts_with("not checked"), "{}", status);
        assert!(status.contains(OPENNEBULA_AUTH_VAR));

        let status = registry_status(&settings, None);
        assert_eq!(status, format!("not checked, {} is not set", OPENNEBULA_AUTH_VAR));
    }

    #[test]
    fn test_dry_run_ignores_malformed_registry_auth() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("stage");
        let settings = settings("qemu-img", &staging);

        migrate(&settings, "web01", MigrationMode::DryRun, true, Some("oneadmin")).unwrap();
        assert!(!staging.exists());
    }

    #[test]
    fn test_local_run_rejects_malformed_registry_auth() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("stage");
        let settings = settings("qemu-img", &staging);

        let err = migrate(&settings, "web01", MigrationMode::Local, true, Some("oneadmin")).unwrap_err();
        assert!(err.to_string().contains(OPENNEBULA_AUTH_VAR), "{}", err);
        assert!(!staging.exists());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(4096 * 1024 * 1024), "4.00 GB");
    }

    #[test]
    fn test_mode_arg_mapping() {
        assert_eq!(MigrationMode::from(ModeArg::DryRun), MigrationMode::DryRun);
        assert_eq!(MigrationMode::from(ModeArg::Full), MigrationMode::Full);
    }

    #[test]
    fn test_cli_parses_migrate() {
        let cli = Cli::parse_from(["onemigrate", "--quiet", "migrate", "web01", "--mode", "dry-run"]);
        assert!(cli.quiet);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_SETTINGS_PATH));
        match cli.command {
            Commands::Migrate { vm_name, mode } => {
                assert_eq!(vm_name, "web01");
                assert!(matches!(mode, ModeArg::DryRun));
            }
            _ => panic!("expected migrate"),
        }
    }
}
