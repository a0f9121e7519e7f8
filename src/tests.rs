//! End-to-end tests against in-process TCP device simulators.

use crate::adapter::{Adapter, AdapterEvent, ReadOptions, ReadScope};
use crate::descriptor::Descriptor;
use crate::error::Error;
use crate::fragment::StopKind;
use crate::protocol::delimited::DelimitedBuilder;
use crate::protocol::modbus::{Modbus, ModbusError};
use crate::stop::StopCondition;
use crate::timeout::{Timeout, TimeoutAction};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

/// Binds an ephemeral port and runs `script` against the first connection.
async fn spawn_device<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            script(stream).await;
        }
    });
    addr
}

fn tcp(addr: SocketAddr) -> Descriptor {
    Descriptor::tcp(addr.ip().to_string(), addr.port())
}

#[tokio::test]
async fn termination_split_across_fragments() {
    let addr = spawn_device(|mut stream| async move {
        stream.write_all(b"ABC\r").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        stream.write_all(b"\nDEF\r\n").await.unwrap();
        sleep(Duration::from_millis(300)).await;
    })
    .await;

    let device = DelimitedBuilder::new(Adapter::new(tcp(addr)))
        .terminator(&b"\r\n"[..])
        .build()
        .await
        .unwrap();
    device.open().await.unwrap();

    assert_eq!(device.read().await.unwrap(), "ABC");
    assert_eq!(device.read().await.unwrap(), "DEF");
}

#[tokio::test]
async fn length_stop_defers_excess_bytes_to_the_next_read() {
    let addr = spawn_device(|mut stream| async move {
        stream.write_all(b"ABCDEFGH").await.unwrap();
        sleep(Duration::from_millis(400)).await;
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .stop_conditions(vec![StopCondition::length(5)])
        .build();
    adapter.open().await.unwrap();

    let first = adapter.read().await.unwrap();
    assert_eq!(first.as_ref(), b"ABCDE");

    // The overrun bytes were deferred; a re-issued read with a matching
    // override consumes them without any new device traffic.
    let second = adapter
        .read_with(ReadOptions::new().stop_conditions(vec![StopCondition::length(3)]))
        .await
        .unwrap();
    assert_eq!(second.as_ref(), b"FGH");
}

#[tokio::test]
async fn continuation_timeout_closes_frames() {
    let addr = spawn_device(|mut stream| async move {
        stream.write_all(b"X").await.unwrap();
        sleep(Duration::from_millis(200)).await;
        stream.write_all(b"Y").await.unwrap();
        sleep(Duration::from_millis(400)).await;
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .stop_conditions(vec![StopCondition::continuation(Duration::from_millis(100))])
        .timeout(Timeout::new(Duration::from_secs(1)))
        .build();
    adapter.open().await.unwrap();

    assert_eq!(adapter.read().await.unwrap().as_ref(), b"X");
    assert_eq!(adapter.read().await.unwrap().as_ref(), b"Y");
}

#[tokio::test]
async fn response_timeout_raises_a_typed_error() {
    let addr = spawn_device(|_stream| async move {
        sleep(Duration::from_millis(400)).await;
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .timeout(Timeout::new(Duration::from_millis(100)))
        .build();
    adapter.open().await.unwrap();

    match adapter.read().await {
        Err(Error::Timeout(window)) => assert_eq!(window, Duration::from_millis(100)),
        other => panic!("expected a timeout error, got {other:?}"),
    }
    // The adapter survives a response timeout.
    assert!(adapter.is_open().await.unwrap());
}

#[tokio::test]
async fn return_empty_then_late_data_is_buffered() {
    let addr = spawn_device(|mut stream| async move {
        sleep(Duration::from_millis(250)).await;
        stream.write_all(b"LATE").await.unwrap();
        sleep(Duration::from_millis(800)).await;
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .stop_conditions(vec![StopCondition::continuation(Duration::from_millis(200))])
        .build();
    adapter.open().await.unwrap();

    let first = adapter
        .read_detailed(ReadOptions::new().timeout(
            Timeout::new(Duration::from_millis(100)).with_action(TimeoutAction::ReturnEmpty),
        ))
        .await
        .unwrap();
    assert!(first.is_empty());
    assert_eq!(first.stop_kind(), None);

    // The data that arrived after the empty read closes under the
    // continuation condition and is served to a later buffered-scope read.
    let second = adapter
        .read_detailed(ReadOptions::new().timeout(Timeout::new(Duration::from_secs(2))))
        .await
        .unwrap();
    assert_eq!(second.payload().as_ref(), b"LATE");
    assert_eq!(second.stop_kind(), Some(StopKind::Continuation));
}

#[tokio::test]
async fn next_scope_skips_frames_that_predate_the_read() {
    let addr = spawn_device(|mut stream| async move {
        stream.write_all(b"OLD\n").await.unwrap();
        sleep(Duration::from_millis(300)).await;
        stream.write_all(b"NEW\n").await.unwrap();
        sleep(Duration::from_millis(300)).await;
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .stop_conditions(vec![StopCondition::termination(&b"\n"[..])])
        .timeout(Timeout::new(Duration::from_secs(2)))
        .build();
    adapter.open().await.unwrap();
    sleep(Duration::from_millis(150)).await;

    let fresh = adapter
        .read_with(ReadOptions::new().scope(ReadScope::Next))
        .await
        .unwrap();
    assert_eq!(fresh.as_ref(), b"NEW\n");

    // The skipped frame is still available to a buffered-scope read.
    let buffered = adapter.read().await.unwrap();
    assert_eq!(buffered.as_ref(), b"OLD\n");
}

#[tokio::test]
async fn flush_read_clears_buffer_and_assembly() {
    let addr = spawn_device(|mut stream| async move {
        stream.write_all(b"JUNK\nPART").await.unwrap();
        sleep(Duration::from_millis(250)).await;
        stream.write_all(b"FRESH\n").await.unwrap();
        sleep(Duration::from_millis(300)).await;
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .stop_conditions(vec![StopCondition::termination(&b"\n"[..])])
        .timeout(Timeout::new(Duration::from_secs(2)))
        .build();
    adapter.open().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // Idempotent, and drops both the completed JUNK frame and the PART
    // assembly.
    adapter.flush_read().await.unwrap();
    adapter.flush_read().await.unwrap();

    assert_eq!(adapter.read().await.unwrap().as_ref(), b"FRESH\n");
}

#[tokio::test]
async fn query_measures_the_response_delay() {
    let addr = spawn_device(|mut stream| async move {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    if stream.write_all(b"PONG\n").await.is_err() {
                        return;
                    }
                }
            }
        }
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .stop_conditions(vec![StopCondition::termination(&b"\n"[..])])
        .timeout(Timeout::new(Duration::from_secs(2)))
        .build();
    adapter.open().await.unwrap();

    let frame = adapter
        .query_detailed(b"PING\n", ReadOptions::new())
        .await
        .unwrap();
    assert_eq!(frame.payload().as_ref(), b"PONG\n");
    // The frame was produced by the device strictly after the write.
    assert!(frame.response_delay().is_some());
    assert_eq!(frame.stop_kind(), Some(StopKind::Termination));
    assert!(!frame.previous_buffer_used());
}

#[tokio::test]
async fn disconnect_cancels_the_pending_read_and_fires_the_callback() {
    let addr = spawn_device(|stream| async move {
        sleep(Duration::from_millis(100)).await;
        drop(stream);
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .timeout(Timeout::new(Duration::from_secs(2)))
        .build();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    adapter
        .set_event_callback(move |event| {
            sink.lock().unwrap().push(event);
        })
        .await
        .unwrap();
    adapter.open().await.unwrap();

    match adapter.read().await {
        Err(Error::Disconnected) => {}
        other => panic!("expected a disconnect error, got {other:?}"),
    }
    assert!(!adapter.is_open().await.unwrap());

    let events = events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, AdapterEvent::Disconnected))
    );
}

#[tokio::test]
async fn open_and_close_are_idempotent() {
    let addr = spawn_device(|_stream| async move {
        sleep(Duration::from_millis(300)).await;
    })
    .await;

    let adapter = Adapter::new(tcp(addr));
    assert!(!adapter.is_open().await.unwrap());
    adapter.open().await.unwrap();
    adapter.open().await.unwrap();
    assert!(adapter.is_open().await.unwrap());
    adapter.close().await.unwrap();
    adapter.close().await.unwrap();
    assert!(!adapter.is_open().await.unwrap());
}

#[tokio::test]
async fn read_on_a_closed_adapter_is_a_configuration_error() {
    let adapter = Adapter::new(Descriptor::tcp("127.0.0.1", 1));
    match adapter.read().await {
        Err(Error::Configuration(_)) => {}
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[tokio::test]
async fn open_failure_is_typed() {
    // Bind then drop, so the port is very likely unoccupied.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let adapter = Adapter::new(tcp(addr));
    match adapter.open().await {
        Err(Error::Open { .. }) => {}
        other => panic!("expected an open error, got {other:?}"),
    }
}

#[tokio::test]
async fn uninitialized_descriptor_refuses_to_open() {
    let adapter = Adapter::new(Descriptor::tcp_host("127.0.0.1"));
    match adapter.open().await {
        Err(Error::Configuration(_)) => {}
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[tokio::test]
async fn write_auto_opens_the_transport() {
    let addr = spawn_device(|_stream| async move {
        sleep(Duration::from_millis(300)).await;
    })
    .await;

    let adapter = Adapter::new(tcp(addr));
    assert!(!adapter.is_open().await.unwrap());
    adapter.write(b"hello").await.unwrap();
    assert!(adapter.is_open().await.unwrap());
}

#[tokio::test]
async fn second_concurrent_read_is_refused() {
    let addr = spawn_device(|_stream| async move {
        sleep(Duration::from_millis(600)).await;
    })
    .await;

    let adapter = Arc::new(
        Adapter::builder(tcp(addr))
            .timeout(Timeout::new(Duration::from_millis(400)))
            .build(),
    );
    adapter.open().await.unwrap();

    let background = {
        let adapter = adapter.clone();
        tokio::spawn(async move { adapter.read().await })
    };
    sleep(Duration::from_millis(50)).await;

    match adapter.read().await {
        Err(Error::Worker(_)) => {}
        other => panic!("expected a worker error, got {other:?}"),
    }
    // The first read still resolves on its own (here: timeout).
    assert!(matches!(background.await.unwrap(), Err(Error::Timeout(_))));
}

#[tokio::test]
async fn frame_buffer_drops_the_oldest_on_overflow() {
    let addr = spawn_device(|mut stream| async move {
        let mut burst = Vec::new();
        for i in 0..300 {
            burst.extend_from_slice(format!("L{i}\n").as_bytes());
        }
        stream.write_all(&burst).await.unwrap();
        sleep(Duration::from_millis(500)).await;
    })
    .await;

    let adapter = Adapter::builder(tcp(addr))
        .stop_conditions(vec![StopCondition::termination(&b"\n"[..])])
        .timeout(Timeout::new(Duration::from_secs(2)))
        .build();
    adapter.open().await.unwrap();
    sleep(Duration::from_millis(300)).await;

    // 300 frames completed; the 256-frame ring dropped L0..=L43.
    assert_eq!(adapter.read().await.unwrap().as_ref(), b"L44\n");
}

#[test]
fn blocking_facade_round_trip() {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 || stream.write_all(b"OK\n").is_err() {
                    break;
                }
            }
        }
    });

    let adapter = Adapter::builder(Descriptor::tcp("127.0.0.1", addr.port()))
        .stop_conditions(vec![StopCondition::termination(&b"\n"[..])])
        .timeout(Timeout::new(Duration::from_secs(2)))
        .build();
    adapter.blocking_open().unwrap();
    let reply = adapter.blocking_query(b"HELLO\n").unwrap();
    assert_eq!(reply.as_ref(), b"OK\n");
    adapter.blocking_close().unwrap();
}

// ---- Modbus simulator ----------------------------------------------------

fn be16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

struct ModbusState {
    coils: [bool; 128],
    holding: [u16; 128],
}

fn modbus_execute(state: &mut ModbusState, pdu: &[u8]) -> Vec<u8> {
    let function = pdu[0];
    let exception = |code: u8| vec![function | 0x80, code];
    match function {
        // read coils
        0x01 => {
            let start = be16(&pdu[1..]) as usize;
            let count = be16(&pdu[3..]) as usize;
            if start + count > state.coils.len() {
                return exception(0x02);
            }
            let mut bytes = vec![0u8; count.div_ceil(8)];
            for i in 0..count {
                if state.coils[start + i] {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            let mut out = vec![function, bytes.len() as u8];
            out.extend_from_slice(&bytes);
            out
        }
        // read holding registers
        0x03 => {
            let start = be16(&pdu[1..]) as usize;
            let count = be16(&pdu[3..]) as usize;
            if start + count > state.holding.len() {
                return exception(0x02);
            }
            let mut out = vec![function, (2 * count) as u8];
            for value in &state.holding[start..start + count] {
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        }
        // write single coil / register: echo the request
        0x05 => {
            let start = be16(&pdu[1..]) as usize;
            state.coils[start] = be16(&pdu[3..]) == 0xFF00;
            pdu.to_vec()
        }
        0x06 => {
            let start = be16(&pdu[1..]) as usize;
            state.holding[start] = be16(&pdu[3..]);
            pdu.to_vec()
        }
        // write multiple coils
        0x0F => {
            let start = be16(&pdu[1..]) as usize;
            let count = be16(&pdu[3..]) as usize;
            if start + count > state.coils.len() {
                return exception(0x02);
            }
            for i in 0..count {
                state.coils[start + i] = pdu[6 + i / 8] & (1 << (i % 8)) != 0;
            }
            let mut out = vec![function];
            out.extend_from_slice(&pdu[1..5]);
            out
        }
        // write multiple registers
        0x10 => {
            let start = be16(&pdu[1..]) as usize;
            let count = be16(&pdu[3..]) as usize;
            if start + count > state.holding.len() {
                return exception(0x02);
            }
            for i in 0..count {
                state.holding[start + i] = be16(&pdu[6 + 2 * i..]);
            }
            let mut out = vec![function];
            out.extend_from_slice(&pdu[1..5]);
            out
        }
        // mask write register: echo the request
        0x16 => {
            let start = be16(&pdu[1..]) as usize;
            let and_mask = be16(&pdu[3..]);
            let or_mask = be16(&pdu[5..]);
            state.holding[start] = (state.holding[start] & and_mask) | (or_mask & !and_mask);
            pdu.to_vec()
        }
        // read/write multiple registers: write first, then read
        0x17 => {
            let read_start = be16(&pdu[1..]) as usize;
            let read_count = be16(&pdu[3..]) as usize;
            let write_start = be16(&pdu[5..]) as usize;
            let write_count = be16(&pdu[7..]) as usize;
            if read_start + read_count > state.holding.len()
                || write_start + write_count > state.holding.len()
            {
                return exception(0x02);
            }
            for i in 0..write_count {
                state.holding[write_start + i] = be16(&pdu[10 + 2 * i..]);
            }
            let mut out = vec![function, (2 * read_count) as u8];
            for value in &state.holding[read_start..read_start + read_count] {
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        }
        _ => exception(0x01),
    }
}

async fn run_modbus_server(mut stream: TcpStream) {
    let mut state = ModbusState {
        coils: [false; 128],
        holding: [0; 128],
    };
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let transaction = be16(&header[0..]);
        let length = be16(&header[4..]) as usize;
        let unit = header[6];
        let mut pdu = vec![0u8; length - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        let response = modbus_execute(&mut state, &pdu);
        let mut reply = Vec::with_capacity(7 + response.len());
        reply.extend_from_slice(&transaction.to_be_bytes());
        reply.extend_from_slice(&[0, 0]);
        reply.extend_from_slice(&((response.len() as u16 + 1).to_be_bytes()));
        reply.push(unit);
        reply.extend_from_slice(&response);
        if stream.write_all(&reply).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn modbus_coil_round_trip() {
    let addr = spawn_device(run_modbus_server).await;
    let mut plc = Modbus::new(Adapter::new(tcp(addr))).await.unwrap();
    plc.adapter().open().await.unwrap();

    let pattern = [true, false, true, true, false];
    plc.write_multiple_coils(1, &pattern).await.unwrap();
    assert_eq!(plc.read_coils(1, 5).await.unwrap(), pattern);
    assert!(plc.read_coil(3).await.unwrap());

    plc.write_single_coil(9, true).await.unwrap();
    assert!(plc.read_coil(9).await.unwrap());
}

#[tokio::test]
async fn modbus_register_round_trip() {
    let addr = spawn_device(run_modbus_server).await;
    let mut plc = Modbus::new(Adapter::new(tcp(addr))).await.unwrap();
    plc.adapter().open().await.unwrap();

    plc.write_single_register(10, 777).await.unwrap();
    assert_eq!(plc.read_holding_register(10).await.unwrap(), 777);

    plc.write_multiple_registers(20, &[1, 2, 3, 4]).await.unwrap();
    assert_eq!(
        plc.read_holding_registers(20, 4).await.unwrap(),
        vec![1, 2, 3, 4]
    );

    // new = (old & AND) | (OR & !AND) with old = 777 = 0x0309
    plc.mask_write_register(10, 0x00FF, 0xAA00).await.unwrap();
    assert_eq!(plc.read_holding_register(10).await.unwrap(), 0xAA09);

    let read_back = plc
        .read_write_multiple_registers(20, 2, 22, &[30, 40])
        .await
        .unwrap();
    assert_eq!(read_back, vec![1, 2]);
    assert_eq!(plc.read_holding_registers(22, 2).await.unwrap(), vec![30, 40]);
}

#[tokio::test]
async fn modbus_exception_is_typed() {
    let addr = spawn_device(run_modbus_server).await;
    let mut plc = Modbus::new(Adapter::new(tcp(addr))).await.unwrap();
    plc.adapter().open().await.unwrap();

    match plc.read_holding_registers(120, 20).await {
        Err(ModbusError::Exception { code, .. }) => assert_eq!(code, 0x02),
        other => panic!("expected a modbus exception, got {other:?}"),
    }
    // The adapter survives an exception and keeps serving requests.
    assert_eq!(plc.read_holding_register(1).await.unwrap(), 0);
}

#[tokio::test]
async fn modbus_preconditions_fail_before_any_bytes_leave() {
    let addr = spawn_device(run_modbus_server).await;
    let mut plc = Modbus::new(Adapter::new(tcp(addr))).await.unwrap();
    plc.adapter().open().await.unwrap();

    // Address 0 does not exist in the 1-based data model.
    assert!(matches!(
        plc.read_coils(0, 1).await,
        Err(ModbusError::Adapter(Error::Configuration(_)))
    ));
    // Count over the per-request register limit.
    assert!(matches!(
        plc.read_holding_registers(1, 126).await,
        Err(ModbusError::Adapter(Error::Configuration(_)))
    ));
}
