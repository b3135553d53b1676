//! Invariants that must hold across operation sequences.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use orchestrator_models::{Address, Message, MessageId, MessageKind, Role};
use orchestrator_runtime::{Orchestrator, RuntimeConfig, SpawnOptions};
use orchestrator_tmux::{MemoryBackend, SessionBackend};
use tempfile::tempdir;

fn open(dir: &std::path::Path, memory: Arc<MemoryBackend>, config: RuntimeConfig) -> Orchestrator {
    Orchestrator::open(dir, config, memory).unwrap()
}

#[tokio::test]
async fn test_restart_count_never_decreases() {
    let dir = tempdir().unwrap();
    let memory = Arc::new(MemoryBackend::new());
    let orch = open(dir.path(), memory.clone(), RuntimeConfig::default());
    let sup = orch.supervisor();

    let w = sup.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
    let mut last = w.restart_count;

    // restart, terminate, window loss and a failing backend, in turn
    for step in 0..8 {
        match step % 4 {
            0 => {
                let _ = sup.restart(&w.id).await;
            }
            1 => {
                let _ = sup.terminate(&w.id).await;
            }
            2 => {
                let current = sup.get(&w.id).unwrap();
                memory.drop_window("proj", current.window);
                let _ = sup.restart(&w.id).await;
            }
            _ => {
                memory.set_unavailable(true);
                let _ = sup.restart(&w.id).await;
                memory.set_unavailable(false);
            }
        }
        let count = sup.get(&w.id).unwrap().restart_count;
        assert!(count >= last, "restart_count went from {} to {}", last, count);
        last = count;
    }
    assert!(last >= 4);
}

#[tokio::test]
async fn test_summarize_never_drops_open_work() {
    let dir = tempdir().unwrap();
    let config = RuntimeConfig::default().with_message_budget(8).with_keep_recent(3);
    let orch = open(dir.path(), Arc::new(MemoryBackend::new()), config);

    let pm = orch
        .supervisor()
        .spawn(Role::Manager, "proj", SpawnOptions::default())
        .await
        .unwrap();
    let dev = orch
        .supervisor()
        .spawn(
            Role::Executor,
            "proj",
            SpawnOptions {
                manager: Some(pm.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut tracked: Vec<MessageId> = Vec::new();
    for i in 0..20 {
        let message = match i % 4 {
            0 => Message::task(pm.id.clone(), dev.id.clone(), format!("task {}", i)),
            1 => Message::escalation(Address::external("cli"), dev.id.clone(), format!("problem {}", i)),
            _ => Message::new(pm.id.clone(), dev.id.clone(), MessageKind::Coordination, format!("note {}", i)),
        };
        if message.is_tracked() {
            tracked.push(message.id.clone());
        }
        orch.router().send(message).await.unwrap();
    }

    let convo = orch.conversations().snapshot(&dev.id).await.unwrap();
    assert!(convo.summary().is_some(), "budget should have triggered compaction");

    let summary = convo.summary().map(|m| m.body.clone()).unwrap_or_default();
    for id in &tracked {
        let verbatim = convo.messages().iter().any(|m| &m.id == id);
        let referenced = summary.contains(id.as_str());
        assert!(verbatim || referenced, "{} lost by compaction", id);
    }
}

#[tokio::test]
async fn test_one_shot_check_in_fires_once_and_cancel_prevents_firing() {
    let dir = tempdir().unwrap();
    let orch = open(dir.path(), Arc::new(MemoryBackend::new()), RuntimeConfig::default());
    let w = orch
        .supervisor()
        .spawn(Role::Executor, "proj", SpawnOptions::default())
        .await
        .unwrap();
    let now = Utc::now();

    let once = orch.scheduler().schedule(&w.id, 5, "once", false, None, now).await.unwrap();
    let cancelled = orch.scheduler().schedule(&w.id, 5, "never", false, None, now).await.unwrap();
    assert!(orch.scheduler().cancel(&cancelled.id).await.unwrap());

    let mut fired = Vec::new();
    for s in 0..20 {
        let report = orch.scheduler().tick(now + ChronoDuration::seconds(s)).await.unwrap();
        fired.extend(report.fired.into_iter().map(|f| f.check_in_id));
    }
    assert_eq!(fired, vec![once.id]);
    assert!(orch.scheduler().pending().await.unwrap().is_empty());

    let bodies: Vec<String> = orch
        .conversations()
        .history(&w.id, None)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec!["once".to_string()]);
}

#[tokio::test]
async fn test_create_session_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let memory = Arc::new(MemoryBackend::new());
    let orch = open(dir.path(), memory.clone(), RuntimeConfig::default());

    let first = orch.supervisor().create_session("proj").await.unwrap();
    let second = orch.supervisor().create_session("proj").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(orch.supervisor().sessions().unwrap().len(), 1);
    let backend_sessions = memory.list_sessions().unwrap();
    assert_eq!(backend_sessions.len(), 1);
    assert_eq!(backend_sessions[0].windows.len(), 1);
}

#[tokio::test]
async fn test_messages_from_one_caller_stay_in_order() {
    let dir = tempdir().unwrap();
    let orch = Arc::new(open(
        dir.path(),
        Arc::new(MemoryBackend::new()),
        RuntimeConfig::default().with_backend_timeout(Duration::from_secs(2)),
    ));
    let w = orch
        .supervisor()
        .spawn(Role::Executor, "proj", SpawnOptions::default())
        .await
        .unwrap();

    // Two callers interleave; each caller's own order must hold.
    let mut handles = Vec::new();
    for caller in ["alice", "bob"] {
        let orch = orch.clone();
        let to = w.id.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..10 {
                let m = Message::new(
                    Address::external(caller),
                    to.clone(),
                    MessageKind::Coordination,
                    format!("{} {}", caller, i),
                );
                ids.push(m.id.clone());
                orch.router().send(m).await.unwrap();
            }
            ids
        }));
    }
    let mut sent = Vec::new();
    for handle in handles {
        sent.push(handle.await.unwrap());
    }

    let history: Vec<MessageId> = orch
        .conversations()
        .history(&w.id, None)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(history.len(), 20);
    for ids in sent {
        let positions: Vec<usize> = ids
            .iter()
            .map(|id| history.iter().position(|h| h == id).unwrap())
            .collect();
        assert!(positions.windows(2).all(|p| p[0] < p[1]));
    }
}
