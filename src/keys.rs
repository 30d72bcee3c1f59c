//! Post-boot key injection.
//!
//! Cloud and installer images often sit in a boot menu countdown. After a
//! launch we press Enter a few times through the control socket. The task is
//! detached and best-effort: connection or protocol failures end it quietly,
//! and the whole sequence is bounded by a deadline.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::platform::ControlEndpoint;
use crate::qmp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInjection {
    /// Wait before dialing the control socket.
    pub settle: Duration,
    pub presses: u32,
    pub interval: Duration,
    /// Upper bound on the task's lifetime.
    pub deadline: Duration,
    pub qcode: String,
}

impl Default for KeyInjection {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(3),
            presses: 3,
            interval: Duration::from_secs(1),
            deadline: Duration::from_secs(15),
            qcode: "ret".into(),
        }
    }
}

/// Start the detached key-injection task for a freshly launched VM.
pub fn spawn_boot_keys(vm: String, endpoint: ControlEndpoint, plan: KeyInjection) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = plan.deadline;
        if tokio::time::timeout(deadline, press_keys(&vm, &endpoint, &plan))
            .await
            .is_err()
        {
            tracing::debug!(vm, "boot key injection hit its deadline");
        }
    })
}

async fn press_keys(vm: &str, endpoint: &ControlEndpoint, plan: &KeyInjection) {
    tokio::time::sleep(plan.settle).await;

    let mut client = match qmp::connect(endpoint, qmp::DEFAULT_TIMEOUT).await {
        Ok(client) => client,
        Err(e) => {
            tracing::debug!(vm, error = %e, "control socket not ready, skipping boot keys");
            return;
        }
    };

    for i in 0..plan.presses {
        if i > 0 {
            tokio::time::sleep(plan.interval).await;
        }
        if let Err(e) = client.send_key(&plan.qcode).await {
            tracing::debug!(vm, error = %e, "boot key injection stopped");
            return;
        }
    }
    tracing::debug!(vm, presses = plan.presses, "boot keys sent");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_plan() -> KeyInjection {
        KeyInjection {
            settle: Duration::from_millis(10),
            presses: 3,
            interval: Duration::from_millis(10),
            deadline: Duration::from_secs(5),
            qcode: "ret".into(),
        }
    }

    #[tokio::test]
    async fn unreachable_socket_ends_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = ControlEndpoint::Unix(dir.path().join("missing.qmp"));
        let handle = spawn_boot_keys("box".into(), endpoint, quick_plan());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task terminates")
            .unwrap();
    }

    #[tokio::test]
    async fn deadline_bounds_the_task() {
        let plan = KeyInjection {
            settle: Duration::from_secs(3600),
            deadline: Duration::from_millis(50),
            ..quick_plan()
        };
        let handle = spawn_boot_keys("box".into(), ControlEndpoint::Tcp(1), plan);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("deadline ends the task")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn presses_configured_number_of_keys() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("vm.qmp");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (a, b) = tokio::io::duplex(4096);
            let relay = tokio::spawn(async move {
                let mut stream = stream;
                let mut b = b;
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut b).await;
            });
            let received = crate::qmp::tests::fake_qmp_server(a).await;
            relay.abort();
            received
        });

        let handle = spawn_boot_keys("box".into(), ControlEndpoint::Unix(socket), quick_plan());
        handle.await.unwrap();

        let received = server.await.unwrap();
        let keys = received
            .iter()
            .filter(|cmd| cmd["execute"] == "send-key")
            .count();
        assert_eq!(keys, 3);
    }
}
