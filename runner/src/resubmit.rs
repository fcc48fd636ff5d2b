//! Resubmission of failed slots.
//!
//! Each iteration reads the campaign report, decides per slot whether it has to be
//! regenerated or only needs missing weights, submits the compute and check jobs and
//! finally chains the next iteration behind the final check.

use crate::{
    check::{
        report::{slot_id_from_path, CheckReport, CorruptedFile},
        CheckError, SUMMARY_FILE,
    },
    collector::slot_dir,
    events::REWEIGHT_EVENT_FILE,
    executors::JobId,
    simulation::{Process, Reweight, SimConfig},
    submit::{Pipeline, SubmitError},
    sync::remove_semaphore,
};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ResubmitError {
    #[error("No check report found at {0}")]
    MissingReport(PathBuf),
    #[error("Failed to read check report")]
    Check(#[from] CheckError),
    #[error("Failed to submit campaign jobs")]
    Submit(#[from] SubmitError),
}

/// Reweighting the controller may request for slots with missing weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReweightRequest {
    #[default]
    None,
    Scale,
    /// weight id `min_id` corresponds to PDF member `min_pdf`
    Pdf { min_id: u32, min_pdf: u32 },
}

/// Values replacing the reconstructed ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub input: Option<PathBuf>,
    pub grids: Option<PathBuf>,
    pub events: Option<u64>,
    pub version: Option<String>,
    pub process: Option<Process>,
}

impl Overrides {
    pub fn apply(&self, mut config: SimConfig) -> SimConfig {
        if let Some(input) = &self.input {
            config.powheg_input = Some(input.clone());
        }
        if let Some(grids) = &self.grids {
            config.grid_repository = Some(grids.clone());
        }
        if let Some(events) = self.events {
            config.events = events;
        }
        if let Some(version) = &self.version {
            config.powheg_version = version.clone();
        }
        if let Some(process) = self.process {
            config.process = process;
        }
        config
    }
}

/// Parameters of a resubmission, carried unchanged from one iteration to the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignParams {
    pub partition: String,
    pub memory_gb: u32,
    pub hours: u32,
    pub overrides: Overrides,
    pub reweight: ReweightRequest,
    pub dry_run: bool,
    /// 1 for the first resubmission
    pub iteration: u32,
    pub max_iterations: Option<u32>,
}

impl Default for CampaignParams {
    fn default() -> Self {
        Self {
            partition: "default".to_owned(),
            memory_gb: 4,
            hours: 10,
            overrides: Overrides::default(),
            reweight: ReweightRequest::None,
            dry_run: false,
            iteration: 1,
            max_iterations: None,
        }
    }
}

impl CampaignParams {
    /// true if another iteration may be chained after the current one
    pub fn continues(&self) -> bool {
        self.max_iterations
            .map_or(true, |max_iterations| self.iteration < max_iterations)
    }

    /// `resubmit` subcommand arguments reproducing these parameters for `iteration`
    pub fn arguments(&self, workdir: &Path, iteration: u32) -> Vec<String> {
        let mut args = vec![
            "resubmit".to_owned(),
            workdir.to_string_lossy().into_owned(),
            "-p".to_owned(),
            self.partition.clone(),
            "--mem".to_owned(),
            self.memory_gb.to_string(),
            "--hours".to_owned(),
            self.hours.to_string(),
        ];

        let overrides = &self.overrides;
        if let Some(version) = &overrides.version {
            args.extend(["-v".to_owned(), version.clone()]);
        }
        if let Some(process) = overrides.process {
            args.extend(["--process".to_owned(), process.to_string()]);
        }
        if let Some(input) = &overrides.input {
            args.extend(["-i".to_owned(), input.to_string_lossy().into_owned()]);
        }
        if let Some(grids) = &overrides.grids {
            args.extend(["-g".to_owned(), grids.to_string_lossy().into_owned()]);
        }
        if let Some(events) = overrides.events {
            args.extend(["-e".to_owned(), events.to_string()]);
        }

        match self.reweight {
            ReweightRequest::None => {}
            ReweightRequest::Scale => args.push("--scalereweight".to_owned()),
            ReweightRequest::Pdf { min_id, min_pdf } => args.extend([
                "--minID".to_owned(),
                min_id.to_string(),
                "--minpdf".to_owned(),
                min_pdf.to_string(),
            ]),
        }

        args.extend(["--iteration".to_owned(), iteration.to_string()]);
        if let Some(max_iterations) = self.max_iterations {
            args.extend(["--max-iterations".to_owned(), max_iterations.to_string()]);
        }

        args
    }
}

/// PDF reweighting covering the missing PDF weight ids `pdf_ids` (sorted).
///
/// Weight id `min_id` belongs to PDF member `min_pdf`, the range spans from the
/// first to the last missing id.
pub fn narrow_pdf_range(pdf_ids: &[u32], min_id: u32, min_pdf: u32) -> Option<Reweight> {
    let first = *pdf_ids.first()?;
    let last = *pdf_ids.last()?;
    let offset = first.checked_sub(min_id)?;
    let min_member = min_pdf.checked_add(offset)?;

    Some(Reweight::Pdf {
        min_pdf: min_member,
        max_pdf: min_member.checked_add(last.checked_sub(first)?)?,
        min_id: first,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// regenerate the slot from scratch
    Full,
    /// only compute the weights selected by the config
    Targeted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSlot {
    pub slot: u32,
    /// slot directory named by the report
    pub dir: PathBuf,
    pub action: Action,
    pub config: SimConfig,
}

/// A slot that was not resubmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSlot {
    pub path: PathBuf,
    pub slot: Option<u32>,
    pub reason: String,
}

impl SkippedSlot {
    fn new(path: impl Into<PathBuf>, slot: Option<u32>, reason: impl Into<String>) -> Self {
        let skipped = Self {
            path: path.into(),
            slot,
            reason: reason.into(),
        };
        error!(
            slot = ?skipped.slot,
            "Skipping {}: {}",
            skipped.path.display(),
            skipped.reason
        );
        skipped
    }
}

/// Configuration of the original run of `slot`, with the overrides applied
fn slot_config(workdir: &Path, slot: u32, overrides: &Overrides) -> Result<SimConfig, String> {
    let config = match SimConfig::reconstruct(workdir, slot) {
        Ok(config) => config,
        Err(error) => match overrides.process {
            Some(process) => {
                warn!(slot = slot, error = %error, "Building configuration from overrides only");
                SimConfig::new(workdir, process)
            }
            None => return Err(format!("cannot reconstruct configuration: {error}")),
        },
    };

    let mut config = overrides.apply(config);
    config.workdir = workdir.to_owned();
    config.min_slot = slot;
    Ok(config)
}

fn targeted_reweight(file: &CorruptedFile, request: ReweightRequest) -> Result<Reweight, String> {
    match request {
        ReweightRequest::None => Err("missing weights but no reweighting requested".to_owned()),
        ReweightRequest::Scale => {
            if file.missing_scale_weights().is_empty() {
                Err("no scale weights missing".to_owned())
            } else {
                // a partial scale sweep is never attempted
                Ok(Reweight::Scale { min_id: 0 })
            }
        }
        ReweightRequest::Pdf { min_id, min_pdf } => {
            let missing = file.missing_pdf_weights();
            if missing.is_empty() {
                return Err("no PDF weights missing".to_owned());
            }
            narrow_pdf_range(&missing, min_id, min_pdf)
                .ok_or_else(|| format!("missing PDF weights {missing:?} are below the minimum id {min_id}"))
        }
    }
}

fn reported_dir(path: &Path, workdir: &Path, slot: u32) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| slot_dir(workdir, slot))
}

/// Decide what to do with every failing slot of the report
pub fn plan(
    report: &CheckReport,
    workdir: &Path,
    params: &CampaignParams,
) -> (Vec<PlannedSlot>, Vec<SkippedSlot>) {
    let mut planned = BTreeMap::new();
    let mut skipped = Vec::new();

    for path in report.failed_files() {
        let slot = match slot_id_from_path(path) {
            Ok(slot) => slot,
            Err(error) => {
                skipped.push(SkippedSlot::new(path, None, error.to_string()));
                continue;
            }
        };
        if planned.contains_key(&slot) {
            debug!(slot = slot, "Slot already planned");
            continue;
        }

        match slot_config(workdir, slot, &params.overrides) {
            Ok(config) => {
                planned.insert(
                    slot,
                    PlannedSlot {
                        slot,
                        dir: reported_dir(path, workdir, slot),
                        action: Action::Full,
                        config: config.with_reweight(Reweight::None),
                    },
                );
            }
            Err(reason) => skipped.push(SkippedSlot::new(path, Some(slot), reason)),
        }
    }

    for file in &report.missing_weights {
        let slot = match file.slot_id() {
            Ok(slot) => slot,
            Err(error) => {
                skipped.push(SkippedSlot::new(&file.path, None, error.to_string()));
                continue;
            }
        };
        if planned.contains_key(&slot) {
            debug!(slot = slot, "Slot already planned for full resubmission");
            continue;
        }

        let planned_slot = targeted_reweight(file, params.reweight).and_then(|reweight| {
            slot_config(workdir, slot, &params.overrides).map(|config| PlannedSlot {
                slot,
                dir: reported_dir(&file.path, workdir, slot),
                action: Action::Targeted,
                config: config.with_reweight(reweight),
            })
        });

        match planned_slot {
            Ok(planned_slot) => {
                planned.insert(slot, planned_slot);
            }
            Err(reason) => skipped.push(SkippedSlot::new(&file.path, Some(slot), reason)),
        }
    }

    (planned.into_values().collect(), skipped)
}

fn remove_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(error) if error.kind() != ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

/// Remove what a resubmission of the slot would trip over.
///
/// Jobs always run in the numbered slot directory, a targeted slot reported under a
/// different name is moved there first.
fn clean_slot(planned: &PlannedSlot) -> io::Result<()> {
    let dir = slot_dir(&planned.config.workdir, planned.slot);
    match planned.action {
        Action::Full => {
            remove_dir(&planned.dir)?;
            remove_dir(&dir)
        }
        Action::Targeted => {
            if planned.dir != dir {
                if dir.exists() {
                    return Err(io::Error::new(
                        ErrorKind::AlreadyExists,
                        format!("both {} and {} exist", planned.dir.display(), dir.display()),
                    ));
                }
                debug!(from = %planned.dir.display(), to = %dir.display(), "Moving slot directory");
                fs::rename(&planned.dir, &dir)?;
            }
            match fs::remove_file(dir.join(REWEIGHT_EVENT_FILE)) {
                Err(error) if error.kind() != ErrorKind::NotFound => return Err(error),
                _ => {}
            }
            remove_semaphore(&dir)
        }
    }
}

#[derive(Debug, Default)]
pub struct ResubmitOutcome {
    pub planned: Vec<PlannedSlot>,
    /// slot and check job id
    pub check_jobs: Vec<(u32, JobId)>,
    pub final_check: Option<JobId>,
    pub next_iteration: Option<JobId>,
    pub skipped: Vec<SkippedSlot>,
}

impl ResubmitOutcome {
    /// true if no slot needed resubmission
    pub fn is_done(&self) -> bool {
        self.planned.is_empty() && self.skipped.is_empty()
    }
}

/// Resubmit every failing slot of the campaign in `workdir`
#[instrument(skip(params, pipeline), fields(iteration = params.iteration), level = "info")]
pub fn resubmit_failed(
    workdir: &Path,
    params: &CampaignParams,
    pipeline: &mut Pipeline,
) -> Result<ResubmitOutcome, ResubmitError> {
    let report_path = workdir.join(SUMMARY_FILE);
    if !report_path.is_file() {
        error!("Check report {} not found", report_path.display());
        return Err(ResubmitError::MissingReport(report_path));
    }

    let report = CheckReport::load(&report_path)?;
    let (planned, skipped) = plan(&report, workdir, params);
    let mut outcome = ResubmitOutcome {
        skipped,
        ..Default::default()
    };

    if planned.is_empty() {
        info!("No slots to resubmit");
        return Ok(outcome);
    }

    if params.dry_run {
        for slot in &planned {
            info!(
                slot = slot.slot,
                action = ?slot.action,
                "Would resubmit: {}",
                slot.config.run_arguments(Some(slot.slot)).join(" ")
            );
        }
        outcome.planned = planned;
        return Ok(outcome);
    }

    for slot in planned {
        let path = slot.dir.clone();
        if let Err(error) = clean_slot(&slot) {
            outcome
                .skipped
                .push(SkippedSlot::new(&path, Some(slot.slot), format!("cleanup failed: {error}")));
            continue;
        }

        let submitted = pipeline
            .submit_slot(&slot.config, slot.slot)
            .and_then(|compute| pipeline.submit_check_slot(workdir, slot.slot, compute));
        match submitted {
            Ok(check) => {
                info!(slot = slot.slot, action = ?slot.action, "Resubmitted slot");
                outcome.check_jobs.push((slot.slot, check));
                outcome.planned.push(slot);
            }
            Err(error) => outcome.skipped.push(SkippedSlot::new(
                &path,
                Some(slot.slot),
                format!("submission failed: {error}"),
            )),
        }
    }

    if outcome.check_jobs.is_empty() {
        warn!("No slot could be resubmitted");
        return Ok(outcome);
    }

    let checks = outcome.check_jobs.iter().map(|(_, id)| *id).collect();
    let final_check = pipeline.submit_final_check(workdir, checks, None)?;
    outcome.final_check = Some(final_check);

    if params.continues() {
        let args = params.arguments(workdir, params.iteration + 1);
        outcome.next_iteration = Some(pipeline.submit_continuation(workdir, args, final_check)?);
    } else {
        info!(iteration = params.iteration, "Reached the maximum number of iterations");
    }

    Ok(outcome)
}
