use super::{ExecutorError, JobCommand, JobId, JobRequest};
use crate::cluster::ClusterProfile;
use itertools::Itertools;
use std::{
    io::{self, Read},
    path::PathBuf,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

const SUBMITTED_MARKER: &str = "Submitted batch job";

/// Submits jobs through `sbatch` and waits for the job id
#[derive(Debug, Clone)]
pub struct SlurmGateway {
    program: PathBuf,
    timeout: Duration,
    profile: ClusterProfile,
}

impl SlurmGateway {
    pub fn new(program: PathBuf, timeout: Duration, profile: ClusterProfile) -> Self {
        Self {
            program,
            timeout,
            profile,
        }
    }

    /// sbatch arguments for a request, the command comes last
    pub fn arguments(&self, request: &JobRequest) -> Vec<String> {
        let batch = &request.batch;
        let mut args = Vec::new();

        if let Some(account) = &self.profile.account {
            args.extend(["-A".to_owned(), account.clone()]);
        }

        args.extend([
            "-N".to_owned(),
            "1".to_owned(),
            "-n".to_owned(),
            "1".to_owned(),
            "-c".to_owned(),
            batch.cpus.to_string(),
        ]);

        let partition = self.profile.partition(&batch.partition);
        if self.profile.use_qos {
            args.push(format!("--qos={partition}"));
        } else {
            args.extend(["--partition".to_owned(), partition.to_owned()]);
        }

        args.extend(["-J".to_owned(), request.job_name.clone()]);
        args.extend(["-o".to_owned(), request.log_file.to_string_lossy().into_owned()]);

        if self.profile.request_resources {
            args.push(format!("--time={}", request.time_limit()));
            args.push(format!("--mem={}G", batch.memory_gb));
        }

        if !batch.dependency.is_empty() {
            args.push(format!(
                "--dependency=afterany:{}",
                batch.dependency.iter().join(":")
            ));
        }

        if let Some(constraint) = &self.profile.constraint {
            args.push(format!("--constraint={constraint}"));
        }
        if let Some(licenses) = &self.profile.licenses {
            args.push(format!("--licenses={licenses}"));
        }
        if let Some(image) = &self.profile.image {
            args.push(format!("--image={image}"));
        }

        if let Some((first, last)) = request.array {
            args.push(format!("--array={first}-{last}"));
        }

        match &request.command {
            JobCommand::Wrap(_) => {
                let command = request.command.to_shell();
                let command = match &self.profile.wrapper {
                    Some(wrapper) => format!("{wrapper} {command}"),
                    None => command,
                };
                args.extend(["--wrap".to_owned(), command]);
            }
            JobCommand::Script(path) => args.push(path.to_string_lossy().into_owned()),
        }

        args
    }

    #[instrument(skip(self, request), fields(job = %request.job_name), level = "debug")]
    pub fn submit(&self, request: &JobRequest) -> Result<JobId, ExecutorError> {
        let args = self.arguments(request);
        let program = self.program.to_string_lossy().into_owned();
        debug!("{program} {}", args.iter().join(" "));

        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| ExecutorError::Spawn(program.clone(), error))?;

        // drained while waiting, a full pipe would block the child
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child
            .wait_timeout(self.timeout)
            .map_err(|error| ExecutorError::Wait(program.clone(), error))?
        {
            Some(status) => status,
            None => {
                // child hasn't exited yet
                if let Err(e) = child.kill() {
                    warn!("Failed to kill {program}: {e}");
                }
                if let Err(e) = child.wait() {
                    warn!("Failed to reap {program}: {e}");
                }
                error!(timeout = ?self.timeout, "Submission of {} timed out", request.job_name);

                return Err(ExecutorError::Timeout {
                    program,
                    timeout: self.timeout,
                });
            }
        };

        let stdout = collect(stdout).map_err(|error| ExecutorError::Wait(program.clone(), error))?;
        let stderr = collect(stderr).map_err(|error| ExecutorError::Wait(program.clone(), error))?;

        if !status.success() {
            error!(status = ?status, stderr = stderr.trim(), "Submission of {} failed", request.job_name);
            return Err(ExecutorError::Failed {
                program,
                status: status.to_string(),
                stderr: stderr.trim().to_owned(),
            });
        }

        let id = parse_job_id(&stdout).ok_or_else(|| ExecutorError::MissingJobId(stdout.trim().to_owned()))?;
        info!(
            job_id = id.0,
            "Submitted {} in {} ms",
            request.job_name,
            start.elapsed().as_millis()
        );

        Ok(id)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut output = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut output)?;
        }
        Ok(output)
    })
}

fn collect(reader: JoinHandle<io::Result<String>>) -> io::Result<String> {
    reader
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output reader panicked"))?
}

/// Job id from the `Submitted batch job <id>` line of sbatch
pub fn parse_job_id(output: &str) -> Option<JobId> {
    output
        .lines()
        .filter_map(|line| line.find(SUBMITTED_MARKER).map(|pos| &line[pos + SUBMITTED_MARKER.len()..]))
        .filter_map(|rest| rest.split_whitespace().next())
        .find_map(|id| id.parse().ok())
        .map(JobId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::Cluster,
        executors::BatchConfig,
    };
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn request(cluster: Cluster) -> JobRequest {
        JobRequest::new(
            JobCommand::Wrap(vec!["pwhg-runner".to_owned(), "check".to_owned(), "/w".to_owned()]),
            "check_pwgevents",
            "/w/logs/joboutput_check.log",
            BatchConfig::new(cluster)
                .with_hours(4)
                .with_memory(2)
                .depends_on([JobId(11), JobId(12)]),
        )
    }

    #[test]
    fn job_id_parsing() {
        assert_eq!(parse_job_id("Submitted batch job 4711\n"), Some(JobId(4711)));
        assert_eq!(
            parse_job_id("sbatch: warning: something\nSubmitted batch job 12 on cluster x\n"),
            Some(JobId(12))
        );
        assert_eq!(parse_job_id("sbatch: error: invalid partition\n"), None);
        assert_eq!(parse_job_id("Submitted batch job abc"), None);
    }

    #[test]
    fn perlmutter_arguments() {
        let gateway = SlurmGateway::new(
            PathBuf::from("sbatch"),
            Duration::from_secs(1),
            ClusterProfile::builtin(Cluster::Perlmutter),
        );
        let args = gateway.arguments(&request(Cluster::Perlmutter).with_array(3, 9));
        assert_eq!(
            args.join(" "),
            "-N 1 -n 1 -c 1 --qos=shared -J check_pwgevents -o /w/logs/joboutput_check.log \
             --time=04:00:00 --mem=2G --dependency=afterany:11:12 --constraint=cpu \
             --licenses=cvmfs,cfs --image=docker:mfasel/cc8-alice:latest --array=3-9 \
             --wrap pwhg-runner check /w"
        );
    }

    #[test]
    fn b587_has_no_resource_flags() {
        let mut profile = ClusterProfile::builtin(Cluster::B587);
        profile.wrapper = Some("/opt/env.sh".to_owned());
        let gateway = SlurmGateway::new(PathBuf::from("sbatch"), Duration::from_secs(1), profile);
        let args = gateway.arguments(&request(Cluster::B587));
        assert!(args.iter().all(|arg| !arg.starts_with("--time") && !arg.starts_with("--mem")));
        assert_eq!(args[4..8], ["-c", "1", "--partition", "long"]);
        assert_eq!(args.last().unwrap(), "/opt/env.sh pwhg-runner check /w");

        let cades = SlurmGateway::new(
            PathBuf::from("sbatch"),
            Duration::from_secs(1),
            ClusterProfile::builtin(Cluster::Cades),
        );
        let args = cades.arguments(&request(Cluster::Cades).with_time_limit_minutes(10));
        assert_eq!(args[..2], ["-A", "birthright"]);
        assert!(args.contains(&"--time=00:10:00".to_owned()));
    }

    fn fake_sbatch(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("sbatch");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn submit_through_fake_sbatch() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let gateway = SlurmGateway::new(
            fake_sbatch(&dir, "echo \"Submitted batch job 815\""),
            Duration::from_secs(10),
            ClusterProfile::builtin(Cluster::B587),
        );
        assert_eq!(gateway.submit(&request(Cluster::B587)).unwrap(), JobId(815));
    }

    #[test]
    fn failing_sbatch_is_an_error() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        let gateway = SlurmGateway::new(
            fake_sbatch(&dir, "echo 'sbatch: error: bad' >&2\nexit 1"),
            Duration::from_secs(10),
            ClusterProfile::builtin(Cluster::B587),
        );
        assert!(matches!(
            gateway.submit(&request(Cluster::B587)),
            Err(ExecutorError::Failed { .. })
        ));

        let gateway = SlurmGateway::new(
            fake_sbatch(&dir, "echo 'queued'"),
            Duration::from_secs(10),
            ClusterProfile::builtin(Cluster::B587),
        );
        assert!(matches!(
            gateway.submit(&request(Cluster::B587)),
            Err(ExecutorError::MissingJobId(_))
        ));
    }

    #[test]
    fn verbose_sbatch_does_not_block() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        // more than a pipe buffer on both streams before the job id
        let gateway = SlurmGateway::new(
            fake_sbatch(
                &dir,
                "i=0\nwhile [ $i -lt 4000 ]; do\n  \
                 echo 'sbatch: note: a rather long line of scheduler chatter to fill the pipe'\n  \
                 echo 'sbatch: warning: the same on stderr, again and again and again' >&2\n  \
                 i=$((i+1))\ndone\necho \"Submitted batch job 816\"",
            ),
            Duration::from_secs(10),
            ClusterProfile::builtin(Cluster::B587),
        );
        assert_eq!(gateway.submit(&request(Cluster::B587)).unwrap(), JobId(816));
    }

    #[test]
    fn missing_sbatch_cannot_spawn() {
        let gateway = SlurmGateway::new(
            PathBuf::from("/does/not/exist/sbatch"),
            Duration::from_secs(1),
            ClusterProfile::builtin(Cluster::B587),
        );
        assert!(matches!(
            gateway.submit(&request(Cluster::B587)),
            Err(ExecutorError::Spawn(..))
        ));
    }
}
