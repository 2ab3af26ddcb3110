use std::sync::Arc;

use gpgbridge_server::{
    environment::{EnvStore, EnvVarEntry, EnvironmentPublisher, FileEnvStore, MemoryEnvStore},
    BridgeError,
};

#[test]
fn failed_apply_leaves_nothing_in_the_persistent_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = Arc::new(FileEnvStore::new(dir.path().join("environment.d").join("gpgbridge.conf")));
    let process = Arc::new(MemoryEnvStore::failing_on("C"));
    let mut env = EnvironmentPublisher::new(process.clone(), file.clone());

    let err = env
        .apply(vec![
            EnvVarEntry::new("A", "valA").persistent(),
            EnvVarEntry::new("B", "valB").persistent(),
            EnvVarEntry::new("C", "valC").persistent(),
        ])
        .unwrap_err();

    assert!(matches!(err, BridgeError::EnvApply { ref name, .. } if name == "C"));
    assert!(err.to_string().contains('C'));
    for name in ["A", "B", "C"] {
        assert_eq!(file.get(name), None);
        assert_eq!(process.get(name), None);
    }
    assert!(!file.path().exists());
}

#[test]
fn revoke_removes_exactly_what_apply_added() {
    let dir = tempfile::tempdir().unwrap();
    let file = Arc::new(FileEnvStore::new(dir.path().join("gpgbridge.conf")));
    file.set("UNRELATED", "keep me").unwrap();
    let process = Arc::new(MemoryEnvStore::new());
    let mut env = EnvironmentPublisher::new(process.clone(), file.clone());

    env.apply(vec![
        EnvVarEntry::new("SSH_AUTH_SOCK", "/run/bridge/openssh-ssh-agent"),
        EnvVarEntry::new("WSL_GNUPG_HOME", r"C:\Users\me\AppData\Roaming\gnupg")
            .persistent()
            .translated(),
    ])
    .unwrap();
    assert_eq!(
        file.get("WSL_GNUPG_HOME").as_deref(),
        Some("/mnt/c/Users/me/AppData/Roaming/gnupg")
    );

    env.revoke();
    env.revoke();
    assert_eq!(file.get("WSL_GNUPG_HOME"), None);
    assert_eq!(file.get("UNRELATED").as_deref(), Some("keep me"));
    assert!(process.is_empty());
}
