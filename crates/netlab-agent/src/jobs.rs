//! Shell commands run on the machine on behalf of a recipe.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

use netlab_common::protocol::{JobResult, JobSignal, JobSpec};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(u64),
    #[error("job {0} did not finish in time")]
    Timeout(u64),
    #[error("failed to start job: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Job {
    pid: Option<u32>,
    result: watch::Receiver<Option<JobResult>>,
}

impl Job {
    fn finished(&self) -> bool {
        self.result.borrow().is_some()
    }
}

pub struct JobManager {
    shell: String,
    next_id: AtomicU64,
    jobs: Mutex<HashMap<u64, Job>>,
    finished: broadcast::Sender<(u64, JobResult)>,
}

impl JobManager {
    pub fn new(shell: impl Into<String>) -> Self {
        let (finished, _) = broadcast::channel(64);
        Self {
            shell: shell.into(),
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(HashMap::new()),
            finished,
        }
    }

    /// Notifications for every job that exits.
    pub fn subscribe(&self) -> broadcast::Receiver<(u64, JobResult)> {
        self.finished.subscribe()
    }

    /// Start `spec` and return its id.
    pub async fn start(&self, spec: &JobSpec) -> Result<u64, JobError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        info!(id, pid, command = %spec.command, "job started");

        let (tx, rx) = watch::channel(None);
        let finished = self.finished.clone();
        tokio::spawn(async move {
            let result = match child.wait_with_output().await {
                Ok(out) => JobResult {
                    passed: out.status.success(),
                    exit_code: out.status.code(),
                    stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                },
                Err(e) => JobResult {
                    passed: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                },
            };
            debug!(id, passed = result.passed, exit_code = ?result.exit_code, "job finished");
            let _ = tx.send(Some(result.clone()));
            let _ = finished.send((id, result));
        });

        self.jobs.lock().await.insert(id, Job { pid, result: rx });
        Ok(id)
    }

    /// Run in the foreground and return the outcome.
    pub async fn run(&self, spec: &JobSpec) -> Result<JobResult, JobError> {
        let id = self.start(spec).await?;
        self.wait(id, None).await
    }

    /// Wait for job `id`. The job is forgotten once its result is returned.
    pub async fn wait(&self, id: u64, timeout: Option<Duration>) -> Result<JobResult, JobError> {
        let mut rx = {
            let jobs = self.jobs.lock().await;
            jobs.get(&id).ok_or(JobError::NotFound(id))?.result.clone()
        };
        let wait = async {
            match rx.wait_for(Option::is_some).await {
                Ok(result) => result.clone(),
                Err(_) => None,
            }
        };
        let result = match timeout {
            Some(t) => tokio::time::timeout(t, wait)
                .await
                .map_err(|_| JobError::Timeout(id))?,
            None => wait.await,
        };
        self.jobs.lock().await.remove(&id);
        result.ok_or(JobError::NotFound(id))
    }

    /// Signal a running job. Signalling a finished job is a no-op.
    pub async fn kill(&self, id: u64, signal: JobSignal) -> Result<(), JobError> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(&id).ok_or(JobError::NotFound(id))?;
        if !job.finished()
            && let Some(pid) = job.pid
        {
            send_signal(pid, signal);
        }
        Ok(())
    }

    /// Kill every running job and forget all of them.
    pub async fn kill_all(&self) {
        let mut jobs = self.jobs.lock().await;
        for (id, job) in jobs.drain() {
            if !job.finished()
                && let Some(pid) = job.pid
            {
                debug!(id, pid, "killing job");
                send_signal(pid, JobSignal::Kill);
            }
        }
    }
}

fn send_signal(pid: u32, signal: JobSignal) {
    let sig = match signal {
        JobSignal::Interrupt => libc::SIGINT,
        JobSignal::Terminate => libc::SIGTERM,
        JobSignal::Kill => libc::SIGKILL,
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        warn!(pid, "pid out of range");
        return;
    };
    // Jobs lead their own process group; signal all of it so commands the
    // shell forked die with it.
    // SAFETY: `pid` is the id of a child we spawned. If the group is already
    // gone kill returns ESRCH and nothing happens.
    unsafe {
        libc::kill(-pid, sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(cmd: &str) -> JobSpec {
        JobSpec {
            command: cmd.into(),
            background: false,
        }
    }

    #[tokio::test]
    async fn foreground_job_reports_output() {
        let jobs = JobManager::new("/bin/sh");
        let res = jobs.run(&job("echo hello; echo oops >&2")).await.unwrap();
        assert!(res.passed);
        assert_eq!(res.exit_code, Some(0));
        assert_eq!(res.stdout.trim(), "hello");
        assert_eq!(res.stderr.trim(), "oops");

        let res = jobs.run(&job("exit 3")).await.unwrap();
        assert!(!res.passed);
        assert_eq!(res.exit_code, Some(3));
    }

    #[tokio::test]
    async fn background_job_can_be_interrupted() {
        let jobs = JobManager::new("/bin/sh");
        let mut finished = jobs.subscribe();
        let id = jobs.start(&job("sleep 30")).await.unwrap();

        assert!(matches!(
            jobs.wait(id, Some(Duration::from_millis(50))).await,
            Err(JobError::Timeout(_))
        ));

        jobs.kill(id, JobSignal::Interrupt).await.unwrap();
        let res = jobs.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        assert!(!res.passed);

        let (done, _) = finished.recv().await.unwrap();
        assert_eq!(done, id);
        assert!(matches!(jobs.wait(id, None).await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn kill_all_stops_everything() {
        let jobs = JobManager::new("/bin/sh");
        let mut finished = jobs.subscribe();
        jobs.start(&job("sleep 30")).await.unwrap();
        jobs.start(&job("sleep 30")).await.unwrap();
        jobs.kill_all().await;

        for _ in 0..2 {
            let (_, res) = tokio::time::timeout(Duration::from_secs(5), finished.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(!res.passed);
        }
    }
}
