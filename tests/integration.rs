//! Cross-component tests: full stacks of controllers, codecs,
//! multiplexers, disconnectors and ports working together.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use skua::{
    json as json_codec, json_document, ChannelCompleter, ChannelController, ChannelError,
    Disconnector, Frame, Multiplexer,
};

fn init_logging() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
}

/// Two multiplexers talking JSON frames over an in-memory byte pair.
fn linked_muxes_over_bytes() -> (Multiplexer<Value>, Multiplexer<Value>) {
    let controller = ChannelController::<Bytes>::new(true);
    let x = Multiplexer::new(controller.local.transform(json_codec::<Frame<Value>>()));
    let y = Multiplexer::new(controller.foreign.transform(json_codec::<Frame<Value>>()));
    (x, y)
}

#[tokio::test]
async fn virtual_channels_work_across_a_json_byte_transport() {
    init_logging();
    let (mut x, mut y) = linked_muxes_over_bytes();

    let mut x_virtual = x.virtual_channel(None).unwrap();
    x.sink().add(json!({ "channel": x_virtual.id() })).unwrap();

    let announcement = y.stream_mut().next().await.unwrap().unwrap();
    let id = announcement["channel"].as_u64().unwrap();
    let mut y_virtual = y.virtual_channel(Some(id)).unwrap();

    x_virtual.sink().add(json!("hello")).unwrap();
    assert_eq!(y_virtual.stream_mut().next().await, Some(Ok(json!("hello"))));

    y_virtual.sink().close().unwrap();
    assert_eq!(x_virtual.stream_mut().next().await, None);
}

#[tokio::test]
async fn malformed_frames_surface_on_the_default_channel() {
    init_logging();
    let controller = ChannelController::<Bytes>::new(true);
    let mut mux = Multiplexer::new(controller.local.transform(json_codec::<Frame<Value>>()));
    let wire = controller.foreign.sink();

    wire.add(Bytes::from_static(b"not a frame")).unwrap();
    wire.add(Bytes::from_static(b"[0,\"ok\"]")).unwrap();

    assert!(matches!(
        mux.stream_mut().next().await,
        Some(Err(ChannelError::Protocol(_)))
    ));
    // The bad frame was skipped, not fatal.
    assert_eq!(mux.stream_mut().next().await, Some(Ok(json!("ok"))));
}

#[tokio::test]
async fn disconnector_severs_a_virtual_channel() {
    init_logging();
    let (x, y) = linked_muxes_over_bytes();
    let x_virtual = x.virtual_channel(None).unwrap();
    let mut y_virtual = y.virtual_channel(Some(x_virtual.id())).unwrap();

    let disconnector = Disconnector::new();
    let wrapped = x_virtual.into_channel().transform(&disconnector);
    let (mut wrapped_stream, wrapped_sink) = wrapped.split();

    wrapped_sink.add(json!(1)).unwrap();
    assert_eq!(y_virtual.stream_mut().next().await, Some(Ok(json!(1))));

    disconnector.disconnect().await;
    wrapped_sink.add(json!(2)).unwrap();
    assert_eq!(wrapped_stream.next().await, None);
    wrapped_sink.done().wait().await.unwrap();
    // The peer sees the virtual channel close; `2` never arrives.
    assert_eq!(y_virtual.stream_mut().next().await, None);
}

#[tokio::test]
async fn completer_buffers_until_a_transport_shows_up() {
    init_logging();
    let (mut completer, channel) = ChannelCompleter::new();
    let sink = channel.sink();
    sink.add("early").unwrap();

    let controller = ChannelController::new(true);
    completer.supply(controller.local).unwrap();
    let (mut foreign_stream, foreign_sink) = controller.foreign.split();
    assert_eq!(foreign_stream.next().await, Some(Ok("early")));

    foreign_sink.add("reply").unwrap();
    let (mut stream, _sink) = channel.split();
    assert_eq!(stream.next().await, Some(Ok("reply")));
}

#[tokio::test]
async fn the_contract_holds_through_a_transformer_stack() {
    init_logging();
    let controller = ChannelController::<Bytes>::new(true);
    let channel = controller.local.transform(json_document());
    let (mut stream, sink) = channel.split();

    sink.add(json!(1)).unwrap();
    let done = sink.close().unwrap();
    // Closing the sink forces the transformed stream's terminal too.
    assert_eq!(stream.next().await, None);
    done.wait().await.unwrap();
    assert_eq!(sink.add(json!(2)), Err(ChannelError::SinkClosed));

    // The remote half observed the values and the terminal.
    let (mut remote_stream, _remote_sink) = controller.foreign.split();
    assert_eq!(
        remote_stream.next().await,
        Some(Ok(Bytes::from_static(b"1")))
    );
    assert_eq!(remote_stream.next().await, None);
}

#[tokio::test]
async fn sink_operations_after_the_remote_terminal_never_raise() {
    init_logging();
    let controller = ChannelController::new(true);
    let local_sink = controller.local.sink();
    let foreign_sink = controller.foreign.sink();

    foreign_sink.close().unwrap();
    local_sink.done().wait().await.unwrap();
    // Everything is silently dropped, nothing raises.
    local_sink.add(1).unwrap();
    local_sink
        .add_error(ChannelError::Remote("late".into()))
        .unwrap();
    local_sink.close().unwrap().wait().await.unwrap();
}
