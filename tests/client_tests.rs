use std::sync::{Arc, Mutex};
use std::time::Duration;

use aircon_lan::{
    DeviceClient, Error, FanSpeed, MessageLogMode, OperationMode, RetryConfig, SetCommand,
    SwingMode, Switch, TemperatureUnit,
};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// What the fake device does with one request.
enum Reply {
    Send(Vec<String>),
    Silent,
}

struct FakeDevice {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn request_seq(xml: &str) -> u32 {
    let start = xml.find("seq=\"").expect("request has seq") + 5;
    let end = start + xml[start..].find('"').expect("seq is quoted");
    xml[start..end].parse().expect("seq is numeric")
}

async fn fake_device<F>(mut respond: F) -> FakeDevice
where
    F: FnMut(usize, &str, u32) -> Reply + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();

    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let xml = String::from_utf8_lossy(&buf[..len]).into_owned();
            let index = {
                let mut requests = recorded.lock().unwrap();
                requests.push(xml.clone());
                requests.len() - 1
            };
            if let Reply::Send(replies) = respond(index, &xml, request_seq(&xml)) {
                for reply in replies {
                    let _ = socket.send_to(reply.as_bytes(), from).await;
                }
            }
        }
    });

    FakeDevice {
        port,
        requests,
        task,
    }
}

fn status_xml(seq: u32) -> String {
    format!(
        r#"<msg msgid="SyncStatusResp" type="Control" seq="{seq}"><statusUpdateMsg><IndoorTemp>26</IndoorTemp><SetTemp>24</SetTemp><BaseMode>cool</BaseMode><WindSpeed>High</WindSpeed><TurnOn>on</TurnOn><WindDirection_H>on</WindDirection_H><WindDirection_V>off</WindDirection_V><Opt_super>off</Opt_super><Opt_sleepMode>off</Opt_sleepMode><Opt_eco>on</Opt_eco></statusUpdateMsg></msg>"#
    )
}

fn ack_xml(seq: u32) -> String {
    format!(r#"<msg msgid="SetMessageResp" type="Control" seq="{seq}"><Return>OK</Return></msg>"#)
}

fn client(port: u16, max_retries: u32) -> DeviceClient {
    DeviceClient::builder("127.0.0.1")
        .port(port)
        .timeout(Duration::from_millis(150))
        .retry(RetryConfig {
            max_retries,
            delay_ms: 10,
            exponential: false,
        })
        .unit(TemperatureUnit::Celsius)
        .build()
        .unwrap()
}

#[tokio::test]
async fn update_state_parses_status() {
    let device = fake_device(|_, _, seq| Reply::Send(vec![status_xml(seq)])).await;
    let client = client(device.port, 0);

    let status = client.update_state().await.expect("status");
    assert_eq!(status.power, Switch::On);
    assert_eq!(status.operation_mode, OperationMode::Cool);
    assert_eq!(status.target_temperature, 24.0);
    assert_eq!(status.current_temperature, Some(26.0));
    assert_eq!(status.fan_speed, FanSpeed::High);
    assert_eq!(status.swing_mode, SwingMode::Horizontal);
    assert_eq!(status.eco_mode, Some(Switch::On));
    assert!(client.is_available());

    let requests = device.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("<SyncStatusReq>"));
}

#[tokio::test]
async fn stale_sequence_is_discarded() {
    let device = fake_device(|_, _, seq| {
        let mut stale = status_xml(seq + 100);
        stale = stale.replace("<SetTemp>24</SetTemp>", "<SetTemp>18</SetTemp>");
        Reply::Send(vec![stale, status_xml(seq)])
    })
    .await;
    let client = client(device.port, 0);

    let status = client.update_state().await.expect("status");
    assert_eq!(status.target_temperature, 24.0);
}

#[tokio::test]
async fn each_attempt_uses_a_fresh_sequence() {
    let device = fake_device(|index, _, seq| {
        if index == 0 {
            Reply::Silent
        } else {
            Reply::Send(vec![status_xml(seq)])
        }
    })
    .await;
    let client = client(device.port, 2);

    client.update_state().await.expect("second attempt answers");

    let requests = device.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_ne!(request_seq(&requests[0]), request_seq(&requests[1]));
}

#[tokio::test]
async fn exhausted_retries_mark_unavailable_until_next_success() {
    let answering = Arc::new(Mutex::new(false));
    let flag = answering.clone();
    let device = fake_device(move |_, _, seq| {
        if *flag.lock().unwrap() {
            Reply::Send(vec![status_xml(seq)])
        } else {
            Reply::Silent
        }
    })
    .await;
    let client = client(device.port, 1);

    let err = client.update_state().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
    assert!(!client.is_available());
    assert_eq!(device.requests.lock().unwrap().len(), 2);

    *answering.lock().unwrap() = true;
    client.update_state().await.expect("device is back");
    assert!(client.is_available());
}

#[tokio::test]
async fn malformed_response_is_parse_error_without_retry() {
    let device =
        fake_device(|_, _, _| Reply::Send(vec!["<msg><statusUpdateMsg><Invalid XML".into()])).await;
    let client = client(device.port, 3);

    let err = client.update_state().await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)), "got {err:?}");
    assert_eq!(device.requests.lock().unwrap().len(), 1);
    assert!(client.is_available());
}

#[tokio::test]
async fn set_command_sends_only_given_fields() {
    let device = fake_device(|_, _, seq| Reply::Send(vec![ack_xml(seq)])).await;
    let client = client(device.port, 0);

    let command = SetCommand {
        power: Some(Switch::On),
        target_temperature: Some(23.0),
        sleep_mode: Some(Switch::Off),
        ..Default::default()
    };
    client.send_set_command(&command).await.expect("ack");

    let requests = device.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let sent = &requests[0];
    assert!(sent.contains(r#"msgid="SetMessage""#));
    assert!(sent.contains("<TurnOn>on</TurnOn>"));
    assert!(sent.contains("<SetTemp>23</SetTemp>"));
    assert!(sent.contains("<Opt_sleepMode>off</Opt_sleepMode>"));
    assert!(!sent.contains("BaseMode"));
    assert!(!sent.contains("WindSpeed"));
}

#[tokio::test]
async fn empty_command_is_not_sent() {
    let device = fake_device(|_, _, seq| Reply::Send(vec![ack_xml(seq)])).await;
    let client = client(device.port, 0);

    client.send_set_command(&SetCommand::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(device.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn single_field_helper() {
    let device = fake_device(|_, _, seq| Reply::Send(vec![ack_xml(seq)])).await;
    let client = client(device.port, 0);

    client.set_fan_speed(FanSpeed::Turbo).await.unwrap();

    let requests = device.requests.lock().unwrap();
    assert!(requests[0].contains("<Opt_super>on</Opt_super>"));
    assert!(!requests[0].contains("WindSpeed"));
}

#[tokio::test]
async fn cleanup_closes_client() {
    let device = fake_device(|_, _, _| Reply::Silent).await;
    let client = Arc::new(client(device.port, 5));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.update_state().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.cleanup();
    client.cleanup();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Closed), "got {err:?}");
    let err = client.update_state().await.unwrap_err();
    assert!(matches!(err, Error::Closed), "got {err:?}");
}

#[tokio::test]
async fn message_log_records_exchange() {
    let device = fake_device(|_, _, seq| Reply::Send(vec![status_xml(seq)])).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages.ndjson");

    let client = DeviceClient::builder("127.0.0.1")
        .port(device.port)
        .unit(TemperatureUnit::Celsius)
        .message_log(MessageLogMode::Full, path.to_str().unwrap())
        .build()
        .unwrap();
    client.update_state().await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(lines.len() >= 2, "{contents}");
    assert!(contents.contains("SyncStatusReq"));
    assert!(contents.contains("statusUpdateMsg"));
}
