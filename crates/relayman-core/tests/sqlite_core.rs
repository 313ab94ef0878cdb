use relayman_core::{Connections, MemoryTransport, RelaymanCore, Storage};
use relayman_types::{AuthMethod, ForwardMode, RateLimitProfile, Settings, TaskStatus};
use std::sync::Arc;
use std::time::Duration;

fn instant_profile() -> RateLimitProfile {
    RateLimitProfile {
        base_delay: 0.0,
        min_delay: 0.0,
        max_delay: 0.01,
        batch_size: 0,
        batch_cooldown: 0.0,
        max_forwards_per_minute: 10_000,
        backoff_multiplier: 1.0,
    }
}

#[tokio::test]
async fn test_progress_persists_across_core_instances() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();
    storage
        .save_settings(&Settings {
            checkpoint_batch: 10,
            user_account: instant_profile(),
            bot_account: instant_profile(),
            ..Settings::default()
        })
        .await
        .unwrap();

    let transport = MemoryTransport::new().with_history("@source", 1..=25);
    let connections = Connections::new().with_user_account(Arc::new(transport.clone()));
    let core = RelaymanCore::new(dir.path().to_path_buf(), connections)
        .await
        .unwrap();
    assert_eq!(core.get_settings().await.checkpoint_batch, 10);

    let id = core
        .start_task("@source", "@dest", AuthMethod::UserAccount, ForwardMode::Complete, 3)
        .await
        .unwrap();

    let mut status = TaskStatus::Running;
    for _ in 0..500 {
        status = core.get_task_status(id).await.unwrap().status;
        if status == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, TaskStatus::Completed);
    drop(core);

    let reopened = RelaymanCore::new(dir.path().to_path_buf(), Connections::new())
        .await
        .unwrap();
    let task = reopened.get_task_status(id).await.unwrap();
    assert_eq!(task.progress.forwarded_count, 25);
    assert_eq!(task.progress.total_messages, 25);
    assert_eq!(task.progress.last_forwarded_message_id, 25);
    assert_eq!(reopened.list_tasks(Some(3)).await.unwrap().len(), 1);

    reopened.delete_task(id, true).await.unwrap();
    assert!(reopened.list_tasks(None).await.unwrap().is_empty());
}
