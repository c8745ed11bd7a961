//! A daemon alone on its ring, driven through a console connection.

mod common;

use std::time::Duration;

use common::{Console, start_node};
use mpd_daemon::Stopped;

#[tokio::test]
async fn test_launch_and_wait_for_exit_code() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(console.request("launch c=/bin/true id=7").await, "7");
    assert_eq!(console.request("getexitcodewait 7").await, "0");
    assert_eq!(console.request("getexitcode 7").await, "0");
    assert_ne!(console.request("getexittime 7").await, "FAIL");

    daemon.shutdown();
    daemon.wait().await.unwrap();
}

#[tokio::test]
async fn test_nonzero_exit_code() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    let id = console.request("launch c='exit 3'").await;
    assert_eq!(console.request(&format!("getexitcodewait {id}")).await, "3");
    assert_eq!(console.request(&format!("freeprocess {id}")).await, "SUCCESS");
    assert_eq!(console.request(&format!("getexitcode {id}")).await, "FAIL");
}

#[tokio::test]
async fn test_launch_as_other_account_is_refused() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;
    let other = if nix::unistd::Uid::effective().is_root() {
        "nobody"
    } else {
        "root"
    };

    let id = console
        .request(&format!("launch c=/bin/true a={other} p=00"))
        .await;
    assert_eq!(console.request(&format!("getexitcodewait {id}")).await, "FAIL");
    let error = console.request(&format!("geterror {id}")).await;
    assert!(error.starts_with(&format!("cannot run as {other}")), "{error}");
}

#[tokio::test]
async fn test_validate_phrase() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(
        console.request(&format!("validate phrase={}", common::PHRASE)).await,
        "SUCCESS"
    );
    assert_eq!(console.request("validate phrase=integratio").await, "FAIL");
    assert_eq!(console.request("validate").await, "FAIL");
}

#[tokio::test]
async fn test_read_int_from_tmp_file() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    let written = console.request("createtmpfile").await;
    std::fs::write(&written, "5150\n").unwrap();
    assert_eq!(
        console.request(&format!("mpich1readint file={written}")).await,
        "5150"
    );

    let empty = console.request("createtmpfile").await;
    let id = console.request("launch c='exit 0'").await;
    let pid = console.request(&format!("getpid {id}")).await;
    assert_eq!(
        console
            .request(&format!("mpich1readint file={empty} pid={pid}"))
            .await,
        "FAIL"
    );

    assert_eq!(console.request("mpich1readint file=/etc/hostname").await, "FAIL");
    for file in [written, empty] {
        assert_eq!(
            console.request(&format!("deletetmpfile file={file}")).await,
            "SUCCESS"
        );
    }
}

#[tokio::test]
async fn test_unknown_launch_id() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(console.request("getpid 99").await, "-1");
    assert_eq!(console.request("getexitcode 99").await, "FAIL");
}

#[tokio::test]
async fn test_unknown_command() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(console.request("frobnicate").await, "ERROR - unknown command");
    assert_eq!(console.request("version").await, mpd_core::MPD_VERSION);
}

#[tokio::test]
async fn test_get_on_missing_host() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(
        console.request("get host=nosuch key=x").await,
        "FAIL - bad hostname"
    );
}

#[tokio::test]
async fn test_local_settings() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(console.request("lset key=color value=blue").await, "SUCCESS");
    assert_eq!(console.request("lget key=color").await, "blue");
    assert_eq!(console.request("get key=color").await, "blue");
    assert_eq!(console.request("ldelete key=color").await, "SUCCESS");
    assert_eq!(console.request("lget key=color").await, "");
}

#[tokio::test]
async fn test_hosts_and_next_on_a_lone_node() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;
    let host = daemon.host().to_string();

    assert_eq!(console.request("hosts").await, format!("result={host}"));

    console.send("next 3").await;
    for _ in 0..3 {
        assert_eq!(console.recv().await, host);
    }
    assert_eq!(
        console.request("next 0").await,
        "Error: invalid number of hosts requested"
    );
}

#[tokio::test]
async fn test_barrier_waits_for_every_member() {
    let daemon = start_node().await;
    let mut first = Console::open(&daemon).await;
    let mut second = Console::open(&daemon).await;

    first.send("barrier name=b count=2").await;
    assert_eq!(first.try_recv(Duration::from_millis(200)).await, None);

    second.send("barrier name=b count=2").await;
    assert_eq!(first.recv().await, "SUCCESS");
    assert_eq!(second.recv().await, "SUCCESS");
}

#[tokio::test]
async fn test_db_lifecycle() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(console.request("dbcreate name=jobs").await, "jobs");
    assert_eq!(console.request("dbput name=jobs key=a value=1").await, "SUCCESS");
    assert_eq!(console.request("dbget name=jobs key=a").await, "1");
    assert_eq!(console.request("dbget name=jobs key=b").await, "FAIL");
    assert_eq!(console.request("dbfirstdb").await, "jobs");
    assert_eq!(console.request("dbnextdb").await, "DBS_END");
    assert_eq!(console.request("dbdestroy name=jobs").await, "SUCCESS");
}

#[tokio::test]
async fn test_print_and_stat() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;
    let host = daemon.host().to_string();

    let summary = console.request("print").await;
    assert!(summary.starts_with(&format!("host={host} left={host} right={host}")));

    let stat = console.request("stat").await;
    assert!(stat.starts_with("contexts="), "unexpected stat: {stat}");
}

#[tokio::test]
async fn test_exitall_stops_the_daemon() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    console.send("exitall").await;
    let stopped = tokio::time::timeout(Duration::from_secs(10), daemon.wait())
        .await
        .expect("daemon should stop")
        .unwrap();
    assert_eq!(stopped, Stopped::Exit);
}

#[tokio::test]
async fn test_restart_stops_for_reexec() {
    let daemon = start_node().await;
    let mut console = Console::open(&daemon).await;

    assert_eq!(console.request("restart").await, "SUCCESS");
    let stopped = tokio::time::timeout(Duration::from_secs(10), daemon.wait())
        .await
        .expect("daemon should stop")
        .unwrap();
    assert_eq!(stopped, Stopped::Restart);
}
