use crate::{
    collector::{Collector, CollectorError},
    events::EVENT_FILE,
    executors::{BatchConfig, ExecutorError, Executors, JobCommand, JobId, JobRequest},
    simulation::{SimConfig, SimConfigError, LOG_DIR, STAGE_DIR},
};
use std::{
    fs,
    io::Error,
    ops::Range,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument};

pub const RESUBMIT_WRAPPER: &str = "resubmit_wrapper.sh";
const RESUBMIT_JOB_NAME: &str = "resubmit_iteration";
const RESUBMIT_TIME_LIMIT_MINUTES: u32 = 10;

const CHECK_MEMORY_GB: u32 = 2;
const CHECK_HOURS: u32 = 4;
const SUMMARY_HOURS: u32 = 1;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Submission failed")]
    Executor(#[from] ExecutorError),
    #[error("Failed to persist simulation record")]
    SimConfig(#[from] SimConfigError),
    #[error("Failed to scan working directory")]
    Collect(#[from] CollectorError),
    #[error("Failed to access {0}")]
    Io(PathBuf, #[source] Error),
    #[error("Working directory {0} already contains events, refusing to overwrite them")]
    EventsExist(PathBuf),
    #[error("Reweighting requires existing events in {0}")]
    NoEvents(PathBuf),
    #[error("A campaign needs at least one slot")]
    NoSlots,
}

impl SubmitError {
    /// true for problems of the request itself rather than of the scheduler
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::EventsExist(_) | Self::NoEvents(_) | Self::NoSlots)
    }
}

/// Jobs of an initial campaign submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignJobs {
    pub compute: JobId,
    pub check: JobId,
    pub summary: JobId,
    pub resubmit: Option<JobId>,
}

/// Builds and submits the jobs of a campaign.
///
/// Every job runs the runner binary itself with one of its subcommands.
#[derive(Debug)]
pub struct Pipeline<'a> {
    executor: &'a mut Executors,
    program: PathBuf,
    global_args: Vec<String>,
    batch: BatchConfig,
}

impl<'a> Pipeline<'a> {
    /// `global_args` are passed to every job before the subcommand, `batch` is used
    /// for the compute jobs
    pub fn new(
        executor: &'a mut Executors,
        program: impl Into<PathBuf>,
        global_args: Vec<String>,
        batch: BatchConfig,
    ) -> Self {
        Self {
            executor,
            program: program.into(),
            global_args,
            batch,
        }
    }

    fn command(&self, args: Vec<String>) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.global_args.iter().cloned())
            .chain(args)
            .collect()
    }

    fn log_file(workdir: &Path, name: &str) -> Result<PathBuf, SubmitError> {
        let logs = workdir.join(LOG_DIR);
        fs::create_dir_all(&logs).map_err(|error| SubmitError::Io(logs.clone(), error))?;
        Ok(logs.join(name))
    }

    fn service_batch(&self, hours: u32, dependency: Vec<JobId>) -> BatchConfig {
        BatchConfig::new(self.batch.cluster)
            .with_partition(self.batch.partition.clone())
            .with_memory(CHECK_MEMORY_GB)
            .with_hours(hours)
            .depends_on(dependency)
    }

    /// Compute job of a single slot, the configuration is persisted for the slot
    #[instrument(skip(self, config), fields(process = %config.process), level = "info")]
    pub fn submit_slot(&mut self, config: &SimConfig, slot: u32) -> Result<JobId, SubmitError> {
        config.store_for_slot(slot)?;
        let log = Self::log_file(&config.workdir, &format!("joboutput{slot}.log"))?;

        let request = JobRequest::new(
            JobCommand::Wrap(self.command(config.run_arguments(Some(slot)))),
            format!("pp_{}", config.process),
            log,
            self.batch.clone(),
        );

        let id = self.executor.submit(&request)?;
        info!(slot = slot, job_id = id.0, "Submitted slot");
        Ok(id)
    }

    /// Compute job array for `slots` slots starting at `config.min_slot`
    #[instrument(skip(self, config), fields(process = %config.process), level = "info")]
    pub fn submit_array(&mut self, config: &SimConfig, slots: u32) -> Result<JobId, SubmitError> {
        if slots == 0 {
            return Err(SubmitError::NoSlots);
        }

        // the campaign record describes the base run, reweighting campaigns keep it
        if !config.is_reweight() {
            config.store_for_stage()?;
        }
        // %a is the array index, which is the slot
        let log = Self::log_file(&config.workdir, "joboutput%a.log")?;
        let first = config.min_slot;
        let last = first + slots - 1;

        let request = JobRequest::new(
            JobCommand::Wrap(self.command(config.run_arguments(None))),
            format!("pp_{}", config.process),
            log,
            self.batch.clone().with_array_size(slots),
        )
        .with_array(first, last);

        let id = self.executor.submit(&request)?;
        info!(job_id = id.0, "Submitted slots {first} to {last}");
        Ok(id)
    }

    /// Check job of a single slot
    pub fn submit_check_slot(
        &mut self,
        workdir: &Path,
        slot: u32,
        dependency: JobId,
    ) -> Result<JobId, SubmitError> {
        let log = Self::log_file(workdir, &format!("joboutput_check{slot}.log"))?;
        let command = self.command(vec![
            "check".to_owned(),
            workdir.to_string_lossy().into_owned(),
            "--slot".to_owned(),
            slot.to_string(),
        ]);

        let request = JobRequest::new(
            JobCommand::Wrap(command),
            "check_pwgevents",
            log,
            self.service_batch(CHECK_HOURS, vec![dependency]),
        );

        let id = self.executor.submit(&request)?;
        info!(slot = slot, job_id = id.0, "Job ID for automatic checking");
        Ok(id)
    }

    /// Check job over every slot of the working directory
    pub fn submit_check_all(&mut self, workdir: &Path, dependency: JobId) -> Result<JobId, SubmitError> {
        let log = Self::log_file(workdir, "joboutput_check.log")?;
        let command = self.command(vec!["check".to_owned(), workdir.to_string_lossy().into_owned()]);

        let request = JobRequest::new(
            JobCommand::Wrap(command),
            "check_pwgevents",
            log,
            self.service_batch(CHECK_HOURS, vec![dependency]),
        );

        let id = self.executor.submit(&request)?;
        info!(job_id = id.0, "Job ID for automatic checking");
        Ok(id)
    }

    /// Final check writing the campaign report once all `dependencies` are done.
    /// Slots of `slots` without a check record are reported as non-existing.
    pub fn submit_final_check(
        &mut self,
        workdir: &Path,
        dependencies: Vec<JobId>,
        slots: Option<Range<u32>>,
    ) -> Result<JobId, SubmitError> {
        let log = Self::log_file(workdir, "joboutput_checksummary.log")?;
        let mut args = vec!["summary".to_owned(), workdir.to_string_lossy().into_owned()];
        if let Some(slots) = slots {
            args.extend([
                "--minslot".to_owned(),
                slots.start.to_string(),
                "--slots".to_owned(),
                slots.len().to_string(),
            ]);
        }

        let request = JobRequest::new(
            JobCommand::Wrap(self.command(args)),
            "checksummary_pwgevents",
            log,
            self.service_batch(SUMMARY_HOURS, dependencies),
        );

        let id = self.executor.submit(&request)?;
        info!(job_id = id.0, "Job ID for analysing checking results");
        Ok(id)
    }

    /// Write the wrapper re-invoking the resubmission with `args` and submit it
    /// after `dependency`
    pub fn submit_continuation(
        &mut self,
        workdir: &Path,
        args: Vec<String>,
        dependency: JobId,
    ) -> Result<JobId, SubmitError> {
        let command = JobCommand::Wrap(self.command(args));
        let wrapper = write_wrapper(workdir, &command.to_shell())?;
        let log = Self::log_file(workdir, "resubmit.log")?;

        let request = JobRequest::new(
            JobCommand::Script(wrapper),
            RESUBMIT_JOB_NAME,
            log,
            BatchConfig::new(self.batch.cluster)
                .with_partition(self.batch.partition.clone())
                .with_memory(CHECK_MEMORY_GB)
                .depends_on([dependency]),
        )
        .with_time_limit_minutes(RESUBMIT_TIME_LIMIT_MINUTES);

        let id = self.executor.submit(&request)?;
        info!(job_id = id.0, "Submitted next iteration");
        Ok(id)
    }

    /// Initial submission of a campaign: compute array, check, final check and
    /// optionally the first resubmission with `resubmit_args`
    #[instrument(skip(self, config, resubmit_args), level = "info")]
    pub fn submit_campaign(
        &mut self,
        config: &SimConfig,
        slots: u32,
        resubmit_args: Option<Vec<String>>,
    ) -> Result<CampaignJobs, SubmitError> {
        let has_events = config.workdir.exists() && Collector::glob(&config.workdir, EVENT_FILE)?.len() > 0;

        if config.is_reweight() && !has_events {
            return Err(SubmitError::NoEvents(config.workdir.clone()));
        }
        if !config.is_reweight() && has_events {
            return Err(SubmitError::EventsExist(config.workdir.clone()));
        }

        let compute = self.submit_array(config, slots)?;
        let check = self.submit_check_all(&config.workdir, compute)?;
        let expected = config.min_slot..config.min_slot + slots;
        let summary = self.submit_final_check(&config.workdir, vec![check], Some(expected))?;
        let resubmit = match resubmit_args {
            Some(args) => Some(self.submit_continuation(&config.workdir, args, summary)?),
            None => None,
        };

        Ok(CampaignJobs {
            compute,
            check,
            summary,
            resubmit,
        })
    }
}

/// Write `workdir/stage/resubmit_wrapper.sh` running `command`
pub fn write_wrapper(workdir: &Path, command: &str) -> Result<PathBuf, SubmitError> {
    let stage = workdir.join(STAGE_DIR);
    fs::create_dir_all(&stage).map_err(|error| SubmitError::Io(stage.clone(), error))?;

    let wrapper = stage.join(RESUBMIT_WRAPPER);
    fs::write(
        &wrapper,
        format!("#!/bin/bash\necho \"Submitting next iteration\"\n{command}\n"),
    )
    .map_err(|error| SubmitError::Io(wrapper.clone(), error))?;
    fs::set_permissions(&wrapper, fs::Permissions::from_mode(0o755))
        .map_err(|error| SubmitError::Io(wrapper.clone(), error))?;

    Ok(wrapper)
}
