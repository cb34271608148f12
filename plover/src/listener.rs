use std::{net::SocketAddr, sync::Arc};

use crate::{Error, ErrorKind, Result, State, TaskSupervisor};

pub struct Listener {
    task_supervisor: TaskSupervisor,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            task_supervisor: TaskSupervisor::create(),
        }
    }

    /// # Errors
    pub async fn start_listen(&self, addr: SocketAddr, state: &Arc<State>) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let state = state.clone();

        let task_supervisor = self.task_supervisor.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = task_supervisor.stopped() => {
                    tracing::info!("stop accept loop: {listener_addr}");
                }
                () = async {
                    tracing::info!("start listening: {listener_addr}");
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                state.task_supervisor.spawn(state.clone().serve_conn(stream, peer));
                            }
                            Err(e) => {
                                tracing::error!("accept on {listener_addr} failed: {e}");
                                break;
                            }
                        }
                    }
                } => {}
            }
        });

        Ok(listener_addr)
    }

    /// Runs `fut` for as long as the listener is alive.
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.task_supervisor.spawn(fut);
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}
