//! Tests for the prepare pipeline's spec transformations: /etc/hosts
//! volume synthesis, DNS propagation, image-volume synthesis, and file
//! injection.

mod common;

use common::FakeStorage;
use podvisor::image::{ContainerConfig, ContainerJson};
use podvisor::pod::{process_image_volumes, process_inject_files, Pod, PodStatus};
use podvisor::spec::{PodSpec, UserFile};
use std::collections::HashMap;
use tempfile::TempDir;

fn make_pod(json: serde_json::Value) -> (Pod, TempDir) {
    let dir = TempDir::new().unwrap();
    let spec = PodSpec::parse(&serde_json::to_vec(&json).unwrap(), "pod-preparetest").unwrap();
    let status = PodStatus::new("pod-preparetest", &spec, dir.path().to_path_buf(), false);
    (Pod::new("pod-preparetest".to_string(), status, spec), dir)
}

// =============================================================================
// /etc/hosts
// =============================================================================

#[test]
fn etc_hosts_adds_one_reference_per_container() {
    let (mut pod, _dir) = make_pod(serde_json::json!({
        "containers": [
            { "name": "web", "image": "nginx" },
            { "name": "db", "image": "postgres" },
        ],
    }));

    pod.prepare_etc_hosts().unwrap();

    let hosts_volumes: Vec<_> = pod
        .spec
        .volumes
        .iter()
        .filter(|v| v.name == "etchosts-volume")
        .collect();
    assert_eq!(hosts_volumes.len(), 1, "one shared volume for the pod");
    assert_eq!(hosts_volumes[0].driver, "vfs");
    assert!(std::path::Path::new(&hosts_volumes[0].source).is_file());

    for c in &pod.spec.containers {
        let refs: Vec<_> = c.volumes.iter().filter(|v| v.path == "/etc/hosts").collect();
        assert_eq!(refs.len(), 1, "container {} gets exactly one reference", c.name);
        assert_eq!(refs[0].volume, "etchosts-volume");
    }
}

#[test]
fn etc_hosts_skips_containers_that_declare_their_own() {
    let (mut pod, _dir) = make_pod(serde_json::json!({
        "files": [{ "name": "myhosts", "contents": "127.0.0.1 me" }],
        "containers": [
            {
                "name": "custom",
                "image": "nginx",
                "files": [{ "filename": "myhosts", "path": "/etc/hosts" }],
            },
            { "name": "plain", "image": "nginx" },
        ],
    }));

    pod.prepare_etc_hosts().unwrap();

    assert!(
        pod.spec.containers[0].volumes.is_empty(),
        "container with its own /etc/hosts file is left alone"
    );
    assert_eq!(pod.spec.containers[1].volumes.len(), 1);
}

#[test]
fn etc_hosts_is_idempotent() {
    let (mut pod, _dir) = make_pod(serde_json::json!({
        "containers": [{ "name": "web", "image": "nginx" }],
    }));

    pod.prepare_etc_hosts().unwrap();
    let after_first = serde_json::to_string(&pod.spec).unwrap();
    pod.prepare_etc_hosts().unwrap();
    let after_second = serde_json::to_string(&pod.spec).unwrap();

    assert_eq!(after_first, after_second);
}

// =============================================================================
// DNS
// =============================================================================

fn write_resolvconf(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("resolv.conf");
    std::fs::write(&path, "nameserver 10.0.0.53\n").unwrap();
    path
}

#[test]
fn dns_is_skipped_when_spec_declares_servers() {
    let (mut pod, dir) = make_pod(serde_json::json!({
        "dns": ["1.1.1.1"],
        "containers": [{ "name": "web", "image": "nginx" }],
    }));
    let resolvconf = write_resolvconf(&dir);

    let before = serde_json::to_string(&pod.spec).unwrap();
    pod.prepare_dns_from(&resolvconf).unwrap();
    let after = serde_json::to_string(&pod.spec).unwrap();

    assert_eq!(before, after, "spec untouched");
}

#[test]
fn dns_is_skipped_when_host_file_is_missing() {
    let (mut pod, dir) = make_pod(serde_json::json!({
        "containers": [{ "name": "web", "image": "nginx" }],
    }));

    let before = serde_json::to_string(&pod.spec).unwrap();
    pod.prepare_dns_from(&dir.path().join("no-such-resolv.conf"))
        .unwrap();
    let after = serde_json::to_string(&pod.spec).unwrap();

    assert_eq!(before, after);
}

#[test]
fn dns_adds_file_and_references() {
    let (mut pod, dir) = make_pod(serde_json::json!({
        "containers": [
            { "name": "web", "image": "nginx" },
            { "name": "db", "image": "postgres" },
        ],
    }));
    let resolvconf = write_resolvconf(&dir);

    pod.prepare_dns_from(&resolvconf).unwrap();

    assert_eq!(pod.spec.files.len(), 1);
    let file = &pod.spec.files[0];
    assert_eq!(file.name, "pod-preparetest-resolvconf");
    assert_eq!(file.encoding, "raw");
    assert_eq!(file.uri, format!("file://{}", resolvconf.display()));

    for c in &pod.spec.containers {
        let refs: Vec<_> = c.files.iter().filter(|f| f.path == "/etc/resolv.conf").collect();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].perm, "0644");
    }
}

#[test]
fn dns_is_idempotent() {
    let (mut pod, dir) = make_pod(serde_json::json!({
        "containers": [{ "name": "web", "image": "nginx" }],
    }));
    let resolvconf = write_resolvconf(&dir);

    pod.prepare_dns_from(&resolvconf).unwrap();
    let after_first = serde_json::to_string(&pod.spec).unwrap();
    pod.prepare_dns_from(&resolvconf).unwrap();
    let after_second = serde_json::to_string(&pod.spec).unwrap();

    assert_eq!(after_first, after_second);
}

#[test]
fn dns_respects_container_with_own_resolvconf() {
    let (mut pod, dir) = make_pod(serde_json::json!({
        "files": [{ "name": "custom-dns", "contents": "nameserver 8.8.8.8" }],
        "containers": [
            {
                "name": "custom",
                "image": "nginx",
                "files": [{ "filename": "custom-dns", "path": "/etc/resolv.conf" }],
            },
            { "name": "plain", "image": "nginx" },
        ],
    }));
    let resolvconf = write_resolvconf(&dir);

    pod.prepare_dns_from(&resolvconf).unwrap();

    assert_eq!(
        pod.spec.containers[0]
            .files
            .iter()
            .filter(|f| f.path == "/etc/resolv.conf")
            .count(),
        1,
        "only the user's own reference remains"
    );
    assert_eq!(
        pod.spec.containers[1]
            .files
            .iter()
            .filter(|f| f.path == "/etc/resolv.conf")
            .count(),
        1,
        "plain container got the host file"
    );
}

// =============================================================================
// Image Volumes
// =============================================================================

#[test]
fn image_volumes_become_pod_volumes() {
    let (mut pod, _dir) = make_pod(serde_json::json!({
        "containers": [{ "name": "db", "image": "postgres" }],
    }));

    let mut volumes = std::collections::BTreeMap::new();
    volumes.insert("/var/lib/data".to_string(), serde_json::Value::Null);
    volumes.insert("/tmp/cache".to_string(), serde_json::Value::Null);
    let info = ContainerJson {
        id: "ctr-0001".to_string(),
        name: "/db".to_string(),
        args: Vec::new(),
        config: ContainerConfig {
            image: "postgres".to_string(),
            volumes,
            ..ContainerConfig::default()
        },
    };

    let mut spec = pod.spec.clone();
    process_image_volumes(&info, "ctr-0001", &mut spec, 0);
    pod.spec = spec;

    let names: Vec<&str> = pod.spec.volumes.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["ctr-0001_tmp_cache", "ctr-0001_var_lib_data"]);
    for v in &pod.spec.volumes {
        assert!(v.source.is_empty(), "synthesized volumes are allocated later");
    }

    let refs = &pod.spec.containers[0].volumes;
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0].path, "/tmp/cache");
    assert_eq!(refs[1].path, "/var/lib/data");
    assert!(!refs[0].read_only);
}

// =============================================================================
// File Injection
// =============================================================================

#[tokio::test]
async fn inject_base64_file_into_directory_target() {
    let dir = TempDir::new().unwrap();
    let storage = FakeStorage::new(dir.path().to_path_buf());

    let spec = PodSpec::parse(
        &serde_json::to_vec(&serde_json::json!({
            "files": [{ "name": "f", "encoding": "base64", "contents": "aGVsbG8=" }],
            "containers": [{
                "name": "web",
                "image": "nginx",
                "files": [{ "filename": "f", "path": "/tmp/" }],
            }],
        }))
        .unwrap(),
        "pod-inject",
    )
    .unwrap();

    let files: HashMap<String, UserFile> = spec
        .files
        .iter()
        .map(|f| (f.name.clone(), f.clone()))
        .collect();

    process_inject_files(
        &spec.containers[0],
        &files,
        storage.as_ref(),
        "mnt-ctr",
        dir.path(),
    )
    .await
    .unwrap();

    let injected = storage.injections();
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].target_path, "/tmp/f");
    assert_eq!(injected[0].contents, b"hello");
    assert_eq!(injected[0].perm, 0o644);
    assert_eq!(injected[0].mount_id, "mnt-ctr");
}

#[tokio::test]
async fn inject_reads_file_uri_sources() {
    let dir = TempDir::new().unwrap();
    let storage = FakeStorage::new(dir.path().to_path_buf());

    let src_path = dir.path().join("app.conf");
    std::fs::write(&src_path, b"listen 8080\n").unwrap();

    let spec = PodSpec::parse(
        &serde_json::to_vec(&serde_json::json!({
            "files": [{ "name": "conf", "uri": format!("file://{}", src_path.display()) }],
            "containers": [{
                "name": "web",
                "image": "nginx",
                "files": [{ "filename": "conf", "path": "/etc/app.conf", "perm": "0600", "user": "1000" }],
            }],
        }))
        .unwrap(),
        "pod-inject",
    )
    .unwrap();

    let files: HashMap<String, UserFile> = spec
        .files
        .iter()
        .map(|f| (f.name.clone(), f.clone()))
        .collect();

    process_inject_files(
        &spec.containers[0],
        &files,
        storage.as_ref(),
        "mnt-ctr",
        dir.path(),
    )
    .await
    .unwrap();

    let injected = storage.injections();
    assert_eq!(injected.len(), 1);
    assert_eq!(injected[0].target_path, "/etc/app.conf");
    assert_eq!(injected[0].contents, b"listen 8080\n");
    assert_eq!(injected[0].perm, 0o600);
    assert_eq!(injected[0].uid, 1000);
}

#[tokio::test]
async fn inject_skips_undeclared_files() {
    let dir = TempDir::new().unwrap();
    let storage = FakeStorage::new(dir.path().to_path_buf());

    let mut container = podvisor::spec::UserContainer::default();
    container.name = "web".to_string();
    container.image = "nginx".to_string();
    container.files.push(podvisor::spec::UserFileReference {
        filename: "ghost".to_string(),
        path: "/tmp/ghost".to_string(),
        ..Default::default()
    });

    process_inject_files(&container, &HashMap::new(), storage.as_ref(), "mnt", dir.path())
        .await
        .unwrap();

    assert!(storage.injections().is_empty());
}
