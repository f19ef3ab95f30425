//! onemigrate Core Library
//!
//! This crate moves a VMware VM's disk into an OpenNebula image catalog.
//!
//! # Overview
//!
//! A migration runs three phases in order: export the disk from vSphere with
//! `ovftool`, convert it from VMDK to QCOW2 with `qemu-img`, and register the
//! result in OpenNebula. The main entry point is [`Pipeline::run`], which
//! decides which phases run for a [`MigrationMode`] and how each phase's
//! failure is treated.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Settings document and credentials
//! - [`job`] - Migration job, modes and staged artifacts
//! - [`locator`] - Finding staged disks on local storage
//! - [`process`] - Supervised external tool invocation with timeouts
//! - [`phase`] - Phase outcomes and failure policies
//! - [`export`] - Export phase (`ovftool`)
//! - [`convert`] - Convert phase (`qemu-img`)
//! - [`upload`] - Upload phase and the image registry seam
//! - [`opennebula`] - OpenNebula XML-RPC client
//! - [`xmlrpc`] - XML-RPC encoding and decoding
//! - [`hypervisor`] - vSphere VM inventory
//! - [`pipeline`] - Orchestrator sequencing the phases
//! - [`report`] - Aggregate run report
//!
//! # Quick Start
//!
//! ```no_run
//! use onemigrate_core::{MigrationJob, MigrationMode, Pipeline, RegistryCredentials, Settings};
//! use std::path::Path;
//!
//! let settings = Settings::load(Path::new("config/settings.yaml")).unwrap();
//! let credentials = RegistryCredentials::from_env().unwrap();
//! let pipeline = Pipeline::from_settings(&settings, None, credentials).unwrap();
//!
//! let job = MigrationJob::new("web01", MigrationMode::Local, &settings.app.staging_path).unwrap();
//! let report = pipeline.run(&job).unwrap();
//! assert!(!report.is_aborted());
//! ```

pub mod config;
pub mod convert;
pub mod error;
pub mod export;
pub mod hypervisor;
pub mod job;
pub mod locator;
pub mod opennebula;
pub mod phase;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod upload;
pub mod xmlrpc;

pub use error::{Error, Result};

// Re-export the types most callers need
pub use config::{RegistryCredentials, Settings, SourceCredentials};
pub use job::{DiskFormat, MigrationJob, MigrationMode, StagedArtifact};
pub use phase::{FailureKind, FailurePolicy, Phase, PhaseFailure, PhaseOutcome, PhasePolicies, PhaseStatus};
pub use pipeline::{Pipeline, PipelineEvent, ProgressCallback};
pub use report::PipelineReport;
pub use upload::{ImageId, RegisteredImage};
