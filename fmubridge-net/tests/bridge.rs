//! Step protocol and instance tests against scripted workers on loopback.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use fmubridge_core::{BridgeConfig, EndpointConfig, ModelState, RetryPolicy, TransportKind};
use fmubridge_net::msg::{self, DataRecord, RecordOp, RECORD_HEADER_LEN, SERVER_READY};
use fmubridge_net::{
    AckCode, BridgeProtocol, BridgeSettings, BridgeState, CancelToken, Error, ModelInstance,
    Socket,
};

fn init_log() {
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
    );
}

fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    (listener, port)
}

fn settings() -> BridgeSettings {
    BridgeSettings {
        retry: RetryPolicy::bounded(50, Duration::from_millis(20)),
        peer_close_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn bridge(port: &str) -> BridgeProtocol {
    let mut bridge =
        BridgeProtocol::new_with_settings(TransportKind::Tcp, settings(), CancelToken::new());
    bridge.initialize("127.0.0.1", port).unwrap();
    bridge
}

fn read_step(stream: &mut TcpStream) -> u64 {
    let mut buf = [0; msg::STEP_REQUEST_LEN];
    stream.read_exact(&mut buf).unwrap();
    msg::decode_step(&buf)
}

fn answer(stream: &mut TcpStream, code: i32) {
    stream.write_all(&msg::encode_status(code)).unwrap();
}

#[test]
fn reset_handshake_reconnects_before_reporting() {
    init_log();
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        assert_eq!(read_step(&mut conn), 1000);
        answer(&mut conn, AckCode::Ok.into());
        assert_eq!(read_step(&mut conn), 2000);
        answer(&mut conn, AckCode::Reset.into());

        // nothing else may arrive on the old connection
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).unwrap();
        drop(conn);

        let (mut conn, _) = listener.accept().unwrap();
        answer(&mut conn, SERVER_READY);
        let next = read_step(&mut conn);
        answer(&mut conn, AckCode::Ok.into());
        (rest, next)
    });

    let mut bridge = bridge(&port);
    assert_eq!(bridge.step(1000).unwrap(), AckCode::Ok);
    assert_eq!(bridge.step(2000).unwrap(), AckCode::Ok);
    assert_eq!(bridge.state(), BridgeState::Connected);
    assert_eq!(bridge.step(3000).unwrap(), AckCode::Ok);

    let (rest, next) = worker.join().unwrap();
    assert!(rest.is_empty());
    assert_eq!(next, 3000);
    bridge.close();
}

#[test]
fn reset_is_acknowledged_when_configured() {
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        read_step(&mut conn);
        answer(&mut conn, AckCode::Reset.into());
        let mut ack = [0; msg::STATUS_WORD_LEN];
        conn.read_exact(&mut ack).unwrap();
        drop(conn);
        let (mut conn, _) = listener.accept().unwrap();
        answer(&mut conn, SERVER_READY);
        msg::decode_status(&ack)
    });

    let settings = BridgeSettings {
        acknowledge_reset: true,
        ..settings()
    };
    let mut bridge =
        BridgeProtocol::new_with_settings(TransportKind::Tcp, settings, CancelToken::new());
    bridge.initialize("127.0.0.1", &port).unwrap();
    assert_eq!(bridge.step(10).unwrap(), AckCode::Ok);
    assert_eq!(worker.join().unwrap(), 3);
}

#[test]
fn wrong_sentinel_is_retried() {
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        read_step(&mut conn);
        answer(&mut conn, AckCode::Reset.into());
        drop(conn);
        let (mut conn, _) = listener.accept().unwrap();
        answer(&mut conn, 42);
        drop(conn);
        let (mut conn, _) = listener.accept().unwrap();
        answer(&mut conn, SERVER_READY);
        let step = read_step(&mut conn);
        answer(&mut conn, AckCode::Ok.into());
        step
    });

    let mut bridge = bridge(&port);
    assert_eq!(bridge.step(5).unwrap(), AckCode::Ok);
    assert_eq!(bridge.step(6).unwrap(), AckCode::Ok);
    assert_eq!(worker.join().unwrap(), 6);
}

#[test]
fn fragmented_delivery_is_reassembled() {
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        conn.set_nodelay(true).unwrap();
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        for chunk in &[&payload[..3], &payload[3..4], &payload[4..]] {
            conn.write_all(chunk).unwrap();
            conn.flush().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
    });

    let mut socket = Socket::new(TransportKind::Tcp);
    socket.configure(&port, "127.0.0.1");
    socket
        .open(&settings().retry, &CancelToken::new())
        .unwrap();
    let mut buf = [0; 8];
    assert_eq!(socket.read_exact(&mut buf).unwrap(), 8);
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    worker.join().unwrap();
}

#[test]
fn bounded_retry_against_closed_port() {
    let (listener, port) = listener();
    drop(listener);

    let settings = BridgeSettings {
        retry: RetryPolicy::bounded(3, Duration::from_millis(10)),
        ..Default::default()
    };
    let mut bridge =
        BridgeProtocol::new_with_settings(TransportKind::Tcp, settings, CancelToken::new());
    match bridge.initialize("127.0.0.1", &port) {
        Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(bridge.state(), BridgeState::Disconnected);
    assert!(bridge
        .transport()
        .last_error_description()
        .starts_with("Socket Error:"));
}

#[test]
fn error_ack_keeps_channel_open() {
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        read_step(&mut conn);
        answer(&mut conn, AckCode::Error.into());
        read_step(&mut conn);
        answer(&mut conn, 99);
        read_step(&mut conn);
        answer(&mut conn, AckCode::Ok.into());
    });

    let mut bridge = bridge(&port);
    assert!(matches!(bridge.step(1), Err(Error::StepFailed(2))));
    assert_eq!(bridge.state(), BridgeState::Connected);
    assert!(matches!(bridge.step(1), Err(Error::StepFailed(99))));
    assert_eq!(bridge.step(1).unwrap(), AckCode::Ok);
    worker.join().unwrap();
}

#[test]
fn peer_loss_disconnects() {
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (conn, _) = listener.accept().unwrap();
        drop(conn);
    });

    let mut bridge = bridge(&port);
    worker.join().unwrap();
    assert!(bridge.step(1).is_err());
    assert_eq!(bridge.state(), BridgeState::Disconnected);
    assert!(matches!(bridge.step(1), Err(Error::NotConnected)));

    bridge.close();
    assert!(matches!(bridge.step(1), Err(Error::BridgeClosed)));
}

#[test]
fn cancel_aborts_reconnect() {
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        read_step(&mut conn);
        answer(&mut conn, AckCode::Reset.into());
        // listener goes away with the connection, reconnects keep failing
    });

    let settings = BridgeSettings {
        retry: RetryPolicy::forever(Duration::from_millis(20)),
        peer_close_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let cancel = CancelToken::new();
    let mut bridge = BridgeProtocol::new_with_settings(TransportKind::Tcp, settings, cancel);
    bridge.initialize("127.0.0.1", &port).unwrap();

    let token = bridge.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        token.cancel();
    });
    assert!(matches!(bridge.step(1), Err(Error::Cancelled)));
    assert_eq!(bridge.state(), BridgeState::Disconnected);
    worker.join().unwrap();
    canceller.join().unwrap();
}

#[test]
fn reconnect_after_reset_uses_one_attempt_budget() {
    let (listener, port) = listener();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        read_step(&mut conn);
        answer(&mut conn, AckCode::Reset.into());
        drop(listener);
        drop(conn);
    });

    let settings = BridgeSettings {
        retry: RetryPolicy::bounded(3, Duration::from_millis(10)),
        peer_close_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let mut bridge =
        BridgeProtocol::new_with_settings(TransportKind::Tcp, settings, CancelToken::new());
    bridge.initialize("127.0.0.1", &port).unwrap();
    match bridge.step(1) {
        Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(bridge.state(), BridgeState::Disconnected);
    worker.join().unwrap();
}

#[test]
fn udp_step_reassembles_split_status() {
    init_log();
    let worker_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = worker_socket.local_addr().unwrap().port().to_string();
    let worker = thread::spawn(move || {
        let codes: [i32; 2] = [AckCode::Ok.into(), AckCode::Error.into()];
        let mut steps = Vec::new();
        for code in &codes {
            let mut buf = [0; msg::STEP_REQUEST_LEN];
            let (len, peer) = worker_socket.recv_from(&mut buf).unwrap();
            assert_eq!(len, msg::STEP_REQUEST_LEN);
            steps.push(msg::decode_step(&buf));
            let status = msg::encode_status(*code);
            worker_socket.send_to(&status[..1], peer).unwrap();
            worker_socket.send_to(&status[1..], peer).unwrap();
        }
        steps
    });

    let mut bridge =
        BridgeProtocol::new_with_settings(TransportKind::Udp, settings(), CancelToken::new());
    bridge.initialize("127.0.0.1", &port).unwrap();
    assert_eq!(bridge.state(), BridgeState::Connected);
    assert_eq!(bridge.step(10).unwrap(), AckCode::Ok);
    assert!(matches!(bridge.step(20), Err(Error::StepFailed(2))));
    assert_eq!(bridge.state(), BridgeState::Connected);
    assert_eq!(worker.join().unwrap(), vec![10, 20]);
    bridge.close();
}

const MODEL: &str = r#"<?xml version="1.0"?>
<fmiModelDescription modelName="ecu" guid="{2}">
  <ModelVariables>
    <ScalarVariable name="speed" valueReference="1" causality="input" declaredType="float32">
      <Real start="0.0"/>
    </ScalarVariable>
    <ScalarVariable name="gear" valueReference="2" causality="output" declaredType="sint8">
      <Integer/>
    </ScalarVariable>
  </ModelVariables>
</fmiModelDescription>
"#;

const ADDRESSES: &str = r#"<ADDRESS-CALCULATOR>
  <MEMORY-ELEMENT><LABEL-NAME>speed</LABEL-NAME><ABSOLUTE-ADDRESS>0x1000</ABSOLUTE-ADDRESS>
    <SIZE>4</SIZE></MEMORY-ELEMENT>
  <MEMORY-ELEMENT><LABEL-NAME>gear</LABEL-NAME><ABSOLUTE-ADDRESS>0x1004</ABSOLUTE-ADDRESS>
    <ROOT-OFFSET>4</ROOT-OFFSET><SIZE>1</SIZE></MEMORY-ELEMENT>
</ADDRESS-CALCULATOR>
"#;

/// Serves data records against a flat memory map until the bridge hangs up.
fn serve_memory(listener: TcpListener, mut memory: HashMap<i64, Vec<u8>>) -> HashMap<i64, Vec<u8>> {
    let (mut conn, _) = listener.accept().unwrap();
    let mut header = [0; RECORD_HEADER_LEN];
    while conn.read_exact(&mut header).is_ok() {
        let record = DataRecord::decode_header(&header).unwrap();
        let mut data = vec![0; record.size as usize];
        match record.op {
            RecordOp::Write => {
                conn.read_exact(&mut data).unwrap();
                memory.insert(record.address, data);
            }
            RecordOp::Read => {
                if let Some(stored) = memory.get(&record.address) {
                    let n = data.len();
                    data.copy_from_slice(&stored[..n]);
                }
                conn.write_all(&data).unwrap();
            }
        }
    }
    memory
}

fn write_model(root: &Path) {
    fs::write(root.join("modelDescription.xml"), MODEL).unwrap();
    fs::create_dir(root.join("resources")).unwrap();
    fs::write(root.join("resources").join("ecu.adx"), ADDRESSES).unwrap();
}

fn endpoint(port: String) -> EndpointConfig {
    EndpointConfig {
        port,
        retry: fmubridge_core::config::RetryConfig {
            max_attempts: 50,
            delay_ms: 20,
        },
        ..Default::default()
    }
}

#[test]
fn instance_exchanges_values_around_steps() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    let (tick_listener, tick_port) = listener();
    let (data_listener, data_port) = listener();
    let ticker = thread::spawn(move || {
        let (mut conn, _) = tick_listener.accept().unwrap();
        let step = read_step(&mut conn);
        answer(&mut conn, AckCode::Ok.into());
        step
    });
    let mut memory = HashMap::new();
    memory.insert(0x1004, vec![3u8]);
    let data_worker = thread::spawn(move || serve_memory(data_listener, memory));

    let config = BridgeConfig {
        data: Some(endpoint(data_port)),
        bridge: endpoint(tick_port),
        ..Default::default()
    };

    let instance = ModelInstance::instantiate("ecu1", dir.path(), config).unwrap();
    instance.enter_initialization_mode().unwrap();
    instance.exit_initialization_mode().unwrap();
    instance.set_real(&[1], &[4.0]).unwrap();
    instance.do_step(0., 0.25).unwrap();

    assert_eq!(instance.get_state().unwrap(), ModelState::StepComplete);
    assert_eq!(instance.get_integer(&[2]).unwrap(), vec![3]);
    assert!((instance.current_time().unwrap() - 0.25).abs() < 1e-9);
    assert_eq!(ticker.join().unwrap(), 250_000);

    instance.terminate().unwrap();
    let memory = data_worker.join().unwrap();
    assert_eq!(memory[&0x1000], 4.0f32.to_le_bytes().to_vec());
}

#[test]
fn reset_waits_for_step_in_flight() {
    init_log();
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());

    let (listener, port) = listener();
    let (received, step_received) = mpsc::channel();
    let (release, released) = mpsc::channel::<()>();
    let worker = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        read_step(&mut conn);
        received.send(()).unwrap();
        released.recv().unwrap();
        answer(&mut conn, AckCode::Ok.into());
        let next = read_step(&mut conn);
        answer(&mut conn, AckCode::Ok.into());
        next
    });

    let config = BridgeConfig {
        bridge: endpoint(port),
        ..Default::default()
    };
    let instance = Arc::new(ModelInstance::instantiate("ecu1", dir.path(), config).unwrap());
    instance.enter_initialization_mode().unwrap();
    instance.exit_initialization_mode().unwrap();

    let stepping = instance.clone();
    let stepper = thread::spawn(move || stepping.do_step(0., 0.1));
    step_received.recv().unwrap();
    assert!(matches!(instance.reset(), Err(Error::InvalidState(_))));
    assert_eq!(instance.get_state().unwrap(), ModelState::StepInProgress);
    release.send(()).unwrap();

    stepper.join().unwrap().unwrap();
    assert_eq!(instance.get_state().unwrap(), ModelState::StepComplete);
    instance.do_step(0.1, 0.2).unwrap();
    assert_eq!(worker.join().unwrap(), 200_000);
    instance.terminate().unwrap();
}
