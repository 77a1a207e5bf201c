//! Worker event loop
//!
//! ```text
//!   bind ──▶ Ready ──▶ serve ────────────── Stop / master gone ──▶ drain ──▶ exit 0
//!    │                  │ accept: count, maybe RequestLimited           │
//!    │                  │ Tasks: spawn batch                            └─ timeout ─▶ exit 1
//!    │                  │ tick: Heartbeat
//!    └─ bind error ─▶ exit 1
//! ```

use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use super::executor::JobExecutor;
use super::service::{RequestContext, Service, StatusService};
use super::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::config::WorkerConfig;
use crate::ipc::{BatchReport, MasterMessage, WorkerEndpoint, WorkerMessage};
use crate::logging::worker_span;
use crate::metrics;
use crate::scheduler::JobList;

/// A single worker: listener, request counter, batch executor
pub struct WorkerRuntime {
    id: u64,
    epoch: u64,
    config: WorkerConfig,
    executor: JobExecutor,
    service: Arc<dyn Service>,
}

impl WorkerRuntime {
    /// Create a worker serving [`StatusService`]
    pub fn new(id: u64, epoch: u64, config: WorkerConfig, jobs: Arc<JobList>) -> Self {
        Self {
            id,
            epoch,
            config,
            executor: JobExecutor::new(jobs),
            service: Arc::new(StatusService),
        }
    }

    /// Replace the request handler
    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.service = service;
        self
    }

    /// Run until drained. Returns the process exit code.
    pub async fn run(self, endpoint: WorkerEndpoint) -> i32 {
        let span = worker_span(self.id, self.epoch);
        self.serve(endpoint).instrument(span).await
    }

    fn bind(&self) -> io::Result<TcpListener> {
        let addr = self.config.listen_addr;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        // Every worker binds the same endpoint
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.bind(addr)?;
        socket.listen(1024)
    }

    async fn serve(self, endpoint: WorkerEndpoint) -> i32 {
        let WorkerEndpoint { mut inbox, outbox } = endpoint;

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %self.config.listen_addr, error = %e, "Failed to bind listening endpoint");
                return EXIT_FAILURE;
            }
        };

        let local_addr = listener.local_addr().ok();
        let _ = outbox.send(WorkerMessage::Ready {
            pid: std::process::id(),
            addr: local_addr,
        });
        info!(addr = ?local_addr, "Worker listening");

        let mut requests: u64 = 0;
        let mut limit_reported = false;
        let mut connections: JoinSet<anyhow::Result<()>> = JoinSet::new();
        let mut batches: JoinSet<BatchReport> = JoinSet::new();

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        requests += 1;
                        metrics::record_request();

                        if requests > self.config.request_limit && !limit_reported {
                            limit_reported = true;
                            warn!(requests, limit = self.config.request_limit, "Request limit exceeded, asking for replacement");
                            let _ = outbox.send(WorkerMessage::RequestLimited { requests });
                        }

                        let service = Arc::clone(&self.service);
                        let ctx = RequestContext {
                            worker_id: self.id,
                            epoch: self.epoch,
                            request_number: requests,
                            peer,
                        };
                        connections.spawn(async move { service.handle(stream, ctx).await });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },

                message = inbox.recv() => match message {
                    Some(MasterMessage::Tasks { indices }) => {
                        debug!(?indices, "Batch received");
                        let executor = self.executor.clone();
                        batches.spawn(async move { executor.run_batch(indices).await });
                    }
                    Some(MasterMessage::Stop) => {
                        info!("Stop received");
                        break;
                    }
                    None => {
                        warn!("Master channel closed");
                        break;
                    }
                },

                _ = heartbeat.tick() => {
                    let _ = outbox.send(WorkerMessage::Heartbeat { requests });
                }

                Some(joined) = connections.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "Request handler failed"),
                    Err(e) => warn!(error = %e, "Request handler aborted"),
                },

                Some(joined) = batches.join_next() => {
                    report_batch(joined, &outbox);
                }
            }
        }

        // Stop accepting before waiting on in-flight work
        drop(listener);
        self.drain(connections, batches, &outbox).await
    }

    async fn drain(
        &self,
        mut connections: JoinSet<anyhow::Result<()>>,
        mut batches: JoinSet<BatchReport>,
        outbox: &mpsc::UnboundedSender<WorkerMessage>,
    ) -> i32 {
        let drain_timeout = self.config.drain_timeout();
        info!(
            requests = connections.len(),
            batches = batches.len(),
            timeout = ?drain_timeout,
            "Draining"
        );

        let wait = async {
            while connections.join_next().await.is_some() {}
            while let Some(joined) = batches.join_next().await {
                report_batch(joined, outbox);
            }
        };

        let outcome = timeout(drain_timeout, wait).await;
        match outcome {
            Ok(()) => {
                info!("Drain complete");
                EXIT_SUCCESS
            }
            Err(_) => {
                error!(
                    requests = connections.len(),
                    batches = batches.len(),
                    "Drain timed out with work still in flight"
                );
                connections.abort_all();
                batches.abort_all();
                EXIT_FAILURE
            }
        }
    }
}

fn report_batch(
    joined: Result<BatchReport, tokio::task::JoinError>,
    outbox: &mpsc::UnboundedSender<WorkerMessage>,
) {
    match joined {
        Ok(report) => {
            debug!(
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                elapsed_ms = report.elapsed_ms,
                "Batch completed"
            );
            let _ = outbox.send(WorkerMessage::BatchCompleted { report });
        }
        Err(e) => warn!(error = %e, "Batch task aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc;
    use crate::scheduler::{FnJob, Job};
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn config(limit: u64) -> WorkerConfig {
        WorkerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            request_limit: limit,
            heartbeat_interval_secs: 3600,
            drain_timeout_secs: 2,
        }
    }

    async fn ready_addr(master: &mut ipc::MasterEndpoint) -> SocketAddr {
        match master.inbox.recv().await {
            Some(WorkerMessage::Ready { addr: Some(addr), .. }) => addr,
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    async fn request(addr: SocketAddr) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, b"GET / HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_then_stop_exits_zero() {
        let (mut master, worker) = ipc::channel();
        let runtime = WorkerRuntime::new(1, 0, config(10), Arc::new(JobList::empty()));
        let handle = tokio::spawn(runtime.run(worker));

        ready_addr(&mut master).await;
        master.outbox.send(MasterMessage::Stop).unwrap();

        assert_eq!(handle.await.unwrap(), EXIT_SUCCESS);
        assert_eq!(master.inbox.recv().await, None);
    }

    #[tokio::test]
    async fn test_request_limited_sent_exactly_once() {
        let (mut master, worker) = ipc::channel();
        let runtime = WorkerRuntime::new(1, 0, config(2), Arc::new(JobList::empty()));
        let handle = tokio::spawn(runtime.run(worker));

        let addr = ready_addr(&mut master).await;
        for _ in 0..5 {
            request(addr).await;
        }

        assert_eq!(
            master.inbox.recv().await,
            Some(WorkerMessage::RequestLimited { requests: 3 })
        );

        // Still serving after the limit
        request(addr).await;

        master.outbox.send(MasterMessage::Stop).unwrap();
        assert_eq!(handle.await.unwrap(), EXIT_SUCCESS);

        let mut limited = 0;
        while let Some(message) = master.inbox.recv().await {
            if matches!(message, WorkerMessage::RequestLimited { .. }) {
                limited += 1;
            }
        }
        assert_eq!(limited, 0);
    }

    #[tokio::test]
    async fn test_tasks_produce_batch_report() {
        let jobs: Vec<Arc<dyn Job>> = vec![
            Arc::new(FnJob::new("a", || async { Ok(()) })),
            Arc::new(FnJob::new("b", || async { Ok(()) })),
        ];
        let (mut master, worker) = ipc::channel();
        let runtime = WorkerRuntime::new(1, 0, config(10), Arc::new(JobList::new(jobs).unwrap()));
        let handle = tokio::spawn(runtime.run(worker));

        ready_addr(&mut master).await;
        master
            .outbox
            .send(MasterMessage::Tasks { indices: vec![0, 1] })
            .unwrap();

        match master.inbox.recv().await {
            Some(WorkerMessage::BatchCompleted { report }) => {
                assert_eq!(report.succeeded, vec![0, 1]);
            }
            other => panic!("expected BatchCompleted, got {other:?}"),
        }

        drop(master.outbox);
        assert_eq!(handle.await.unwrap(), EXIT_SUCCESS);
    }

    #[tokio::test]
    async fn test_bind_failure_exits_one_without_ready() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut cfg = config(10);
        cfg.listen_addr = taken.local_addr().unwrap();

        let (mut master, worker) = ipc::channel();
        let runtime = WorkerRuntime::new(1, 0, cfg, Arc::new(JobList::empty()));

        assert_eq!(runtime.run(worker).await, EXIT_FAILURE);
        assert_eq!(master.inbox.recv().await, None);
    }
}
