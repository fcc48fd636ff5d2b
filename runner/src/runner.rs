use crate::{
    collector::slot_dir,
    events::{self, EVENT_FILE, REWEIGHT_EVENT_FILE},
    powheg::{self, Variation},
    simulation::{Process, Reweight},
    sync::{remove_semaphore, Semaphore},
};
use itertools::Itertools;
use rand::Rng;
use std::{
    fs::{self, File},
    io::Error,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub const INPUT_FILE: &str = "powheg.input";
pub const BASE_INPUT_FILE: &str = "powheg_base.input";
pub const POWHEG_LOG: &str = "pwhg.log";
const MAX_SEED: u32 = 32767;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Scale and PDF reweighting cannot run in the same job")]
    ExclusiveReweight,
    #[error("Reweighting requires --minid")]
    MissingMinId,
    #[error("PDF reweighting requires both --minpdf and --maxpdf")]
    IncompletePdfRange,
    #[error("Cannot run with existing grids in reweight mode")]
    ReweightWithGrids,
    #[error("POWHEG input {0} does not exist")]
    MissingInput(PathBuf),
    #[error("Reweighting requires existing events in {0}")]
    MissingEvents(PathBuf),
    #[error("No base POWHEG input for reweighting in {0}")]
    MissingBaseInput(PathBuf),
    #[error("Complete events already found in {0}")]
    EventsExist(PathBuf),
    #[error("Slot directory {0} is not empty")]
    NotEmpty(PathBuf),
    #[error("Failed to access {0}")]
    Io(PathBuf, #[source] Error),
    #[error("Failed to run {0}")]
    Spawn(String, #[source] Error),
}

/// Settings of a single `run` invocation
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workdir: PathBuf,
    pub input: Option<PathBuf>,
    pub process: Process,
    pub events: u64,
    pub grids: Option<PathBuf>,
    pub slot: Option<u32>,
    pub slot_offset: u32,
    pub scale_reweight: bool,
    pub min_pdf: Option<u32>,
    pub max_pdf: Option<u32>,
    pub min_id: Option<u32>,
    pub version: String,
}

impl RunOptions {
    pub fn new(workdir: impl Into<PathBuf>, process: Process) -> Self {
        Self {
            workdir: workdir.into(),
            input: None,
            process,
            events: 0,
            grids: None,
            slot: None,
            slot_offset: 0,
            scale_reweight: false,
            min_pdf: None,
            max_pdf: None,
            min_id: None,
            version: String::new(),
        }
    }

    /// the run mode selected by the flags
    pub fn reweight(&self) -> Result<Reweight, RunnerError> {
        let pdf = match (self.min_pdf, self.max_pdf) {
            (Some(min_pdf), Some(max_pdf)) => Some((min_pdf, max_pdf)),
            (None, None) => None,
            _ => return Err(RunnerError::IncompletePdfRange),
        };

        let reweight = match (self.scale_reweight, pdf) {
            (true, Some(_)) => return Err(RunnerError::ExclusiveReweight),
            (true, None) => Reweight::Scale {
                min_id: self.min_id.ok_or(RunnerError::MissingMinId)?,
            },
            (false, Some((min_pdf, max_pdf))) => Reweight::Pdf {
                min_pdf,
                max_pdf,
                min_id: self.min_id.ok_or(RunnerError::MissingMinId)?,
            },
            (false, None) => Reweight::None,
        };

        if reweight != Reweight::None && self.grids.is_some() {
            return Err(RunnerError::ReweightWithGrids);
        }

        Ok(reweight)
    }

    /// `workdir/<slot + offset>` if a slot is known, the working directory otherwise
    pub fn slot_dir(&self) -> PathBuf {
        match self.slot {
            Some(slot) => slot_dir(&self.workdir, slot + self.slot_offset),
            None => self.workdir.clone(),
        }
    }
}

/// Runs POWHEG inside one slot directory
#[derive(Debug)]
pub struct SlotRunner {
    options: RunOptions,
    reweight: Reweight,
    slot_dir: PathBuf,
    executable: PathBuf,
    base_input: Option<PathBuf>,
}

impl SlotRunner {
    /// Validate the options and prepare the slot directory
    #[instrument(skip(options), fields(slot_dir = %options.slot_dir().display()), level = "info")]
    pub fn init(options: RunOptions) -> Result<Self, RunnerError> {
        let reweight = options.reweight()?;
        let slot_dir = options.slot_dir();
        let executable = PathBuf::from(options.process.executable());

        let mut runner = Self {
            options,
            reweight,
            slot_dir,
            executable,
            base_input: None,
        };

        match runner.reweight {
            Reweight::None => runner.prepare_base()?,
            _ => runner.prepare_reweight()?,
        }

        Ok(runner)
    }

    /// Run a different binary instead of `pwhg_main_<process>`
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.slot_dir.join(name)
    }

    fn prepare_base(&mut self) -> Result<(), RunnerError> {
        let input = match &self.options.input {
            Some(input) if input.is_file() => input.clone(),
            Some(input) => return Err(RunnerError::MissingInput(input.clone())),
            None => return Err(RunnerError::MissingInput(PathBuf::from(INPUT_FILE))),
        };

        if self.slot_dir.exists() {
            if Semaphore::exists(&self.slot_dir) {
                warn!(
                    "Found semaphore in {}, previous run did not finish - reprocessing",
                    self.slot_dir.display()
                );
                fs::remove_dir_all(&self.slot_dir).map_err(|e| RunnerError::Io(self.slot_dir.clone(), e))?;
            } else if events::parse(self.file(EVENT_FILE)).complete {
                error!("Complete events already found in {}, not running again", self.slot_dir.display());
                return Err(RunnerError::EventsExist(self.slot_dir.clone()));
            } else if fs::read_dir(&self.slot_dir)
                .map_err(|e| RunnerError::Io(self.slot_dir.clone(), e))?
                .next()
                .is_some()
            {
                return Err(RunnerError::NotEmpty(self.slot_dir.clone()));
            }
        }

        fs::create_dir_all(&self.slot_dir).map_err(|e| RunnerError::Io(self.slot_dir.clone(), e))?;

        let content = fs::read_to_string(&input).map_err(|e| RunnerError::Io(input.clone(), e))?;
        let content = if self.options.events > 0 {
            powheg::events_input(&content, self.options.events)
        } else {
            content
        };
        let target = self.file(INPUT_FILE);
        fs::write(&target, content).map_err(|e| RunnerError::Io(target, e))?;

        if let Some(grids) = self.options.grids.clone() {
            self.stage_grids(&grids)?;
        }

        Ok(())
    }

    fn stage_grids(&self, grids: &Path) -> Result<(), RunnerError> {
        let files = fs::read_dir(grids)
            .map_err(|e| RunnerError::Io(grids.to_owned(), e))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .sorted()
            .collect_vec();

        for file in files.iter() {
            if let Some(name) = file.file_name() {
                let target = self.slot_dir.join(name);
                // the input was written for this slot and must not be replaced
                if target.exists() {
                    debug!("Not staging {}, already present", file.display());
                    continue;
                }
                fs::copy(file, &target).map_err(|e| RunnerError::Io(file.clone(), e))?;
            }
        }

        info!("Staged {} grid files from {}", files.len(), grids.display());
        Ok(())
    }

    fn prepare_reweight(&mut self) -> Result<(), RunnerError> {
        if !self.file(EVENT_FILE).is_file() {
            error!("Require existing {EVENT_FILE} in {} for reweight mode", self.slot_dir.display());
            return Err(RunnerError::MissingEvents(self.slot_dir.clone()));
        }

        if Semaphore::exists(&self.slot_dir) {
            warn!(
                "Found semaphore in {}, discarding partial reweight output",
                self.slot_dir.display()
            );
            remove_file(&self.file(REWEIGHT_EVENT_FILE))?;
            remove_semaphore(&self.slot_dir).map_err(|e| RunnerError::Io(self.slot_dir.clone(), e))?;
        }

        let base = self.file(BASE_INPUT_FILE);
        let current = self.file(INPUT_FILE);
        if !base.exists() && current.is_file() {
            fs::rename(&current, &base).map_err(|e| RunnerError::Io(current.clone(), e))?;
        }

        self.base_input = match &self.options.input {
            Some(input) if input.is_file() => Some(input.clone()),
            Some(input) => return Err(RunnerError::MissingInput(input.clone())),
            None if base.is_file() => Some(base),
            None => return Err(RunnerError::MissingBaseInput(self.slot_dir.clone())),
        };

        Ok(())
    }

    /// Run all pending work of the slot, returns the number of POWHEG invocations
    #[instrument(skip(self), fields(slot_dir = %self.slot_dir.display()), level = "info")]
    pub fn run(&self) -> Result<usize, RunnerError> {
        let start = Instant::now();

        let runs = match self.reweight {
            Reweight::None => {
                info!("Running standard POWHEG job");
                self.run_powheg(POWHEG_LOG)?;
                1
            }
            Reweight::Scale { min_id } => self.run_variations(powheg::scale_variations(min_id))?,
            Reweight::Pdf {
                min_pdf,
                max_pdf,
                min_id,
            } => self.run_variations(powheg::pdf_variations(min_pdf, max_pdf, min_id))?,
        };

        let elapsed = start.elapsed().as_secs();
        info!(
            "POWHEG processing finished, took {}:{:02}:{:02} ({elapsed} seconds total)",
            elapsed / 3600,
            (elapsed / 60) % 60,
            elapsed % 60
        );

        Ok(runs)
    }

    fn run_variations(&self, variations: Vec<(u32, Variation)>) -> Result<usize, RunnerError> {
        let base_path = self
            .base_input
            .as_ref()
            .ok_or_else(|| RunnerError::MissingBaseInput(self.slot_dir.clone()))?;
        let base = fs::read_to_string(base_path).map_err(|e| RunnerError::Io(base_path.clone(), e))?;
        let mut runs = 0;

        for (weight_id, variation) in variations {
            let reweighted = self.file(REWEIGHT_EVENT_FILE);
            if reweighted.exists() {
                warn!("Removing stale {REWEIGHT_EVENT_FILE} in {}", self.slot_dir.display());
                remove_file(&reweighted)?;
            }

            if events::parse(self.file(EVENT_FILE)).has_weight(&weight_id.to_string()) {
                info!(
                    weight_id = weight_id,
                    "Variation {variation} already existing, not running again"
                );
                continue;
            }

            info!(weight_id = weight_id, "Running variation {variation}");
            let tag = variation.tag();
            let input = self.file(INPUT_FILE);
            fs::write(&input, powheg::reweight_input(&base, &variation, weight_id))
                .map_err(|e| RunnerError::Io(input.clone(), e))?;

            self.run_powheg(&format!("pwhg_{tag}.log"))?;
            runs += 1;

            if reweighted.exists() {
                let events = self.file(EVENT_FILE);
                fs::rename(&reweighted, &events).map_err(|e| RunnerError::Io(reweighted.clone(), e))?;
            } else {
                warn!(weight_id = weight_id, "POWHEG did not produce {REWEIGHT_EVENT_FILE}");
            }

            if input.exists() {
                let staged = self.file(&format!("powheg_{tag}.input"));
                fs::rename(&input, &staged).map_err(|e| RunnerError::Io(input.clone(), e))?;
            }
        }

        Ok(runs)
    }

    /// One invocation of the POWHEG binary under the semaphore
    fn run_powheg(&self, log: &str) -> Result<(), RunnerError> {
        let input = self.file(INPUT_FILE);
        let content = fs::read_to_string(&input).map_err(|e| RunnerError::Io(input.clone(), e))?;
        let seed = rand::rng().random_range(0..=MAX_SEED);
        info!("Using random seed: {seed}");
        fs::write(&input, powheg::with_seed(&content, seed)).map_err(|e| RunnerError::Io(input.clone(), e))?;

        let log = self.file(log);
        let stdout = File::create(&log).map_err(|e| RunnerError::Io(log.clone(), e))?;
        let stderr = stdout.try_clone().map_err(|e| RunnerError::Io(log.clone(), e))?;
        let program = self.executable.to_string_lossy().into_owned();

        let semaphore = Semaphore::create(&self.slot_dir).map_err(|e| RunnerError::Io(self.slot_dir.clone(), e))?;
        debug!("Running {program} in {}", self.slot_dir.display());
        let status = Command::new(&self.executable)
            .current_dir(&self.slot_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .map_err(|e| RunnerError::Spawn(program.clone(), e))?;
        semaphore.remove().map_err(|e| RunnerError::Io(self.slot_dir.clone(), e))?;

        // POWHEG exit codes are unreliable, the check job judges the output
        if !status.success() {
            warn!(status = ?status, "{program} returned unsuccessfully, see {}", log.display());
        }

        Ok(())
    }
}

fn remove_file(path: &Path) -> Result<(), RunnerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RunnerError::Io(path.to_owned(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const EVENTS: &str = "<LesHouchesEvents version=\"3.0\">
<header>
<initrwgt>
<weight id='main'> default </weight>
</initrwgt>
</header>
<event>
</event>
</LesHouchesEvents>
";

    /// fake POWHEG: writes reweighted events carrying the requested weight id
    fn fake_powheg(dir: &Path) -> PathBuf {
        let path = dir.join("pwhg_main_fake");
        fs::write(
            &path,
            "#!/bin/sh
if grep -q compute_rwgt powheg.input; then
  id=$(sed -n \"s/^lhrwgt_id '\\(.*\\)'/\\1/p\" powheg.input)
  sed \"s#</initrwgt>#<weight id='$id'> x </weight>\\n</initrwgt>#\" pwgevents.lhe > pwgevents-rwgt.lhe
else
  test -f pwgsemaphore.txt || exit 3
  cat > pwgevents.lhe <<EOF
<LesHouchesEvents version=\"3.0\">
<event>
</event>
</LesHouchesEvents>
EOF
fi
",
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn input(dir: &Path) -> PathBuf {
        let path = dir.join("powheg.input");
        fs::write(&path, "numevts 100\nlhans1 10800\n").unwrap();
        path
    }

    #[test]
    fn flag_validation() {
        let mut options = RunOptions::new("/w", Process::Dijet);
        assert_eq!(options.reweight().unwrap(), Reweight::None);

        options.scale_reweight = true;
        assert!(matches!(options.reweight(), Err(RunnerError::MissingMinId)));
        options.min_id = Some(0);
        assert_eq!(options.reweight().unwrap(), Reweight::Scale { min_id: 0 });

        options.min_pdf = Some(100);
        assert!(matches!(options.reweight(), Err(RunnerError::IncompletePdfRange)));
        options.max_pdf = Some(101);
        assert!(matches!(options.reweight(), Err(RunnerError::ExclusiveReweight)));

        options.scale_reweight = false;
        options.grids = Some(PathBuf::from("/grids"));
        assert!(matches!(options.reweight(), Err(RunnerError::ReweightWithGrids)));
    }

    #[test]
    fn slot_directory() {
        let mut options = RunOptions::new("/w", Process::Dijet);
        assert_eq!(options.slot_dir(), PathBuf::from("/w"));
        options.slot = Some(3);
        options.slot_offset = 10;
        assert_eq!(options.slot_dir(), PathBuf::from("/w/0013"));
    }

    #[test]
    fn base_run_writes_events_under_semaphore() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let mut options = RunOptions::new(dir.path(), Process::Dijet);
        options.input = Some(input(dir.path()));
        options.events = 20;
        options.slot = Some(1);

        let runner = SlotRunner::init(options.clone())
            .unwrap()
            .with_executable(fake_powheg(dir.path()));
        assert_eq!(runner.run().unwrap(), 1);

        let slot = dir.path().join("0001");
        let written = fs::read_to_string(slot.join(INPUT_FILE)).unwrap();
        assert!(written.starts_with("numevts 20\n"));
        assert!(written.contains("iseed "));
        assert!(events::parse(slot.join(EVENT_FILE)).complete);
        assert!(!Semaphore::exists(&slot));

        // complete events are never overwritten
        assert!(matches!(
            SlotRunner::init(options),
            Err(RunnerError::EventsExist(_))
        ));
    }

    #[test]
    fn stale_semaphore_discards_slot() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let slot = dir.path().join("0002");
        fs::create_dir_all(&slot).unwrap();
        fs::write(slot.join(EVENT_FILE), "<event>\n").unwrap();
        Semaphore::create(&slot).unwrap();

        let mut options = RunOptions::new(dir.path(), Process::Dijet);
        options.input = Some(input(dir.path()));
        options.slot = Some(2);
        SlotRunner::init(options).unwrap();

        assert!(!slot.join(EVENT_FILE).exists());
        assert!(!Semaphore::exists(&slot));
        assert!(slot.join(INPUT_FILE).exists());
    }

    #[test]
    fn leftovers_without_semaphore_are_refused() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let slot = dir.path().join("0003");
        fs::create_dir_all(&slot).unwrap();
        fs::write(slot.join("pwhg.log"), "").unwrap();

        let mut options = RunOptions::new(dir.path(), Process::Dijet);
        options.input = Some(input(dir.path()));
        options.slot = Some(3);
        assert!(matches!(SlotRunner::init(options.clone()), Err(RunnerError::NotEmpty(_))));

        options.input = Some(dir.path().join("missing.input"));
        assert!(matches!(SlotRunner::init(options), Err(RunnerError::MissingInput(_))));
    }

    #[test]
    fn pdf_reweight_skips_existing_weights() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let slot = dir.path().join("0004");
        fs::create_dir_all(&slot).unwrap();
        fs::write(
            slot.join(EVENT_FILE),
            EVENTS.replace("</initrwgt>", "<weight id='9'> pdf 108 </weight>\n</initrwgt>"),
        )
        .unwrap();
        fs::write(slot.join(INPUT_FILE), "numevts 100\nlhans1 10800\nstoreinfo_rwgt 1\n").unwrap();

        let mut options = RunOptions::new(dir.path(), Process::Dijet);
        options.slot = Some(4);
        options.min_pdf = Some(108);
        options.max_pdf = Some(110);
        options.min_id = Some(9);

        let runner = SlotRunner::init(options)
            .unwrap()
            .with_executable(fake_powheg(dir.path()));
        assert!(slot.join(BASE_INPUT_FILE).exists());
        assert_eq!(runner.run().unwrap(), 2);

        let info = events::parse(slot.join(EVENT_FILE));
        for id in ["main", "9", "10", "11"] {
            assert!(info.has_weight(id), "missing weight {id}");
        }
        assert!(slot.join("powheg_PDF109.input").exists());
        assert!(slot.join("powheg_PDF110.input").exists());
        assert!(!slot.join("powheg_PDF108.input").exists());
        assert!(!slot.join(REWEIGHT_EVENT_FILE).exists());

        let staged = fs::read_to_string(slot.join("powheg_PDF110.input")).unwrap();
        assert!(staged.contains("lhans1 110\n"));
        assert!(!staged.contains("storeinfo_rwgt"));
    }

    #[test]
    fn reweight_needs_events() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let mut options = RunOptions::new(dir.path(), Process::Dijet);
        options.slot = Some(5);
        options.scale_reweight = true;
        options.min_id = Some(0);
        assert!(matches!(SlotRunner::init(options), Err(RunnerError::MissingEvents(_))));
    }
}
