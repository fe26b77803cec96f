//! Cross-module integration tests (§8): exercises the public
//! `meshmgrd` API the way an external caller (CLI, virtual-node server)
//! would, rather than reaching into manager-internal helpers.

use std::path::Path;
use std::sync::Arc;

use meshmgrd::config::Config;
use meshmgrd::manager::Manager;
use meshmgrd::push::NullPushNotifier;
use meshmgrd::store::{JsonStore, MeshStore};
use meshmgrd::virtual_node::NullBroadcaster;

#[tokio::test]
async fn init_writes_a_config_the_run_path_can_load() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("meshmgrd.toml");

    Config::create_default(config_path.to_str().unwrap()).await.unwrap();
    let config = Config::load(config_path.to_str().unwrap()).await.unwrap();

    assert_eq!(config.session.port, Config::default().session.port);
}

#[tokio::test]
async fn manager_handle_rejects_outbound_calls_before_the_first_connect_event() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.store.data_dir = dir.path().join("data").to_string_lossy().into_owned();
    // Port 0 never accepts; the transport task will sit retrying in the
    // background without ever emitting `Connected`.
    config.session.host = "127.0.0.1".to_string();
    config.session.port = 0;

    let store: Arc<dyn MeshStore> = Arc::new(JsonStore::new(Path::new(&config.store.data_dir)).await.unwrap());
    let push = Arc::new(NullPushNotifier);
    let virtual_node = Arc::new(NullBroadcaster);

    let (manager, handle) = Manager::connect(config, store, push, virtual_node, None);
    let dispatch = tokio::spawn(manager.run());

    let result = handle.add_favorite_node(42).await;
    assert!(result.is_err());
    assert!(handle.init_capture_snapshot().is_empty());

    handle.disconnect().await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), dispatch).await;
}

#[tokio::test]
async fn status_reads_back_settings_written_through_the_store_trait() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::new(dir.path().join("data")).await.unwrap();

    assert_eq!(store.get_setting("localNodeId").await.unwrap(), None);
    store.set_setting("localNodeId", "!deadbeef").await.unwrap();
    store.set_setting("localNodeNum", "3735928559").await.unwrap();

    assert_eq!(
        store.get_setting("localNodeId").await.unwrap().as_deref(),
        Some("!deadbeef")
    );
    assert_eq!(
        store.get_setting("localNodeNum").await.unwrap().as_deref(),
        Some("3735928559")
    );
}
