//! Sender behavior as observed from the consumer side.

#![allow(clippy::unwrap_used)]
#![allow(clippy::float_cmp)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use softcam::{FrameBuffer, FrameBufferConfig, Sender, dib_image_size, frame_size};

fn test_config(tag: &str) -> FrameBufferConfig {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    FrameBufferConfig::with_prefix(&format!(
        "softcam-sender-it/{}/{tag}/{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ))
}

#[test]
fn consumer_receives_sent_frames() {
    let config = test_config("stream");
    let mut sender = Sender::with_config(&config, 16, 8, 0.0).unwrap();
    let consumer = FrameBuffer::open_with_config(&config);
    assert!(sender.wait_for_connection(1.0));

    let mut dib = vec![0u8; dib_image_size(16, 8)];
    for value in 1..=5u8 {
        sender.send_frame(&vec![value; frame_size(16, 8)]).unwrap();
        let counter = consumer.transfer_to_dib(&mut dib).unwrap();
        assert_eq!(counter, u64::from(value));
        assert!(dib.iter().all(|&b| b == value));
    }
}

#[test]
fn sender_waits_for_late_consumer() {
    let config = test_config("late");
    let sender = Sender::with_config(&config, 8, 8, 30.0).unwrap();

    let opener = {
        let config = config.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            FrameBuffer::open_with_config(&config)
        })
    };

    assert!(sender.wait_for_connection(10.0));
    let consumer = opener.join().unwrap();
    assert!(consumer.is_usable());
    assert_eq!(consumer.framerate(), 30.0);
}

#[test]
fn dropped_sender_dims_last_frame() {
    let config = test_config("drop");
    let mut sender = Sender::with_config(&config, 8, 4, 0.0).unwrap();
    let consumer = FrameBuffer::open_with_config(&config);

    sender.send_frame(&vec![200u8; frame_size(8, 4)]).unwrap();
    assert!(consumer.active());
    drop(sender);

    assert!(!consumer.active());
    let mut dib = vec![0u8; dib_image_size(8, 4)];
    assert_eq!(consumer.transfer_to_dib(&mut dib).unwrap(), 1);
    assert!(dib.iter().all(|&b| b == 50));

    // A consumer blocked on the next frame is released at once
    consumer.wait_for_new_frame(1, 0.0);
}

#[test]
fn name_is_free_after_sender_and_consumers_drop() {
    let config = test_config("reuse");
    let sender = Sender::with_config(&config, 8, 8, 0.0).unwrap();
    let consumer = FrameBuffer::open_with_config(&config);
    drop(sender);
    drop(consumer);

    let again = Sender::with_config(&config, 16, 16, 0.0).unwrap();
    assert_eq!(again.width(), 16);
    assert!(!again.is_connected());
}
