use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use roc_core::channel::{ChannelBase, ChannelParameters};
use roc_core::CardFamily;
use roc_hw_sim::SimBackend;

fn params(map: &[(&str, &str)]) -> ChannelParameters {
    let map: HashMap<String, String> = map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    ChannelParameters::from_map(&map).unwrap()
}

fn temp_buffer_path() -> (tempfile::NamedTempFile, String) {
    let file = tempfile::NamedTempFile::new().unwrap();
    let path = file.path().to_string_lossy().into_owned();
    (file, path)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn model_a_full_lifecycle_pushes_and_pops_a_superpage() {
    init_tracing();
    let backend = Arc::new(SimBackend::new(CardFamily::A));
    let (_guard, path) = temp_buffer_path();
    let size = (4 * 1024 * 1024).to_string();
    let p = params(&[
        ("card-id", "1000"),
        ("channel", "0"),
        ("buffer-type", "file"),
        ("buffer-path", path.as_str()),
        ("buffer-size", size.as_str()),
        ("dma-page-size", "8192"),
    ]);

    let mut channel = ChannelBase::open(backend, p).unwrap();
    assert_eq!(channel.card_type(), CardFamily::A);
    assert_eq!(channel.channel_number(), 0);

    channel.start_dma().unwrap();
    // One 1 MiB superpage = 128 pages at the default 8 KiB page size,
    // exactly the ReadyFIFO's capacity.
    channel.push_superpage(0, 1024 * 1024).unwrap();

    let mut popped = None;
    for _ in 0..200 {
        channel.fill_superpages().unwrap();
        if channel.ready_queue_size().unwrap() > 0 {
            popped = Some(channel.pop_superpage().unwrap());
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let superpage = popped.expect("superpage should have arrived within the polling window");
    assert_eq!(superpage.offset, 0);
    assert_eq!(superpage.size, 1024 * 1024);
    assert!(superpage.ready);

    channel.stop_dma().unwrap();
    channel.close().unwrap();
}

#[test]
fn model_b_full_lifecycle_pushes_and_pops_a_superpage() {
    init_tracing();
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    let (_guard, path) = temp_buffer_path();
    let size = (4 * 1024 * 1024).to_string();
    let p = params(&[
        ("card-id", "2000"),
        ("channel", "0"),
        ("buffer-type", "file"),
        ("buffer-path", path.as_str()),
        ("buffer-size", size.as_str()),
        ("dma-page-size", "32768"),
        ("generator-enabled", "true"),
        ("data-source", "internal"),
    ]);

    let mut channel = ChannelBase::open(backend, p).unwrap();
    assert_eq!(channel.card_type(), CardFamily::B);

    channel.start_dma().unwrap();
    channel.push_superpage(0, 32 * 1024).unwrap();

    let mut popped = None;
    for _ in 0..200 {
        channel.fill_superpages().unwrap();
        if channel.ready_queue_size().unwrap() > 0 {
            popped = Some(channel.pop_superpage().unwrap());
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let superpage = popped.expect("superpage should have arrived within the polling window");
    assert_eq!(superpage.offset, 0);
    assert!(superpage.ready);

    channel.stop_dma().unwrap();
    channel.close().unwrap();
}

#[test]
fn transfer_queue_starts_at_full_capacity_for_a_freshly_opened_channel() {
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    let (_guard, path) = temp_buffer_path();
    let size = (16 * 1024 * 1024).to_string();
    let p = params(&[
        ("card-id", "2000"),
        ("channel", "0"),
        ("buffer-type", "file"),
        ("buffer-path", path.as_str()),
        ("buffer-size", size.as_str()),
        ("dma-page-size", "8192"),
    ]);

    let channel = ChannelBase::open(backend, p).unwrap();
    assert_eq!(channel.transfer_queue_available().unwrap(), 32);
    assert_eq!(channel.ready_queue_size().unwrap(), 0);

    channel.close().unwrap();
}

#[test]
fn pushing_32_superpages_fills_the_queue_and_the_33rd_fails() {
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    let (_guard, path) = temp_buffer_path();
    let size = (64 * 1024 * 1024).to_string();
    let p = params(&[
        ("card-id", "2000"),
        ("channel", "0"),
        ("buffer-type", "file"),
        ("buffer-path", path.as_str()),
        ("buffer-size", size.as_str()),
        ("dma-page-size", "8192"),
    ]);

    let mut channel = ChannelBase::open(backend, p).unwrap();
    channel.start_dma().unwrap();

    for i in 0..32 {
        channel.push_superpage(i * 1024 * 1024, 1024 * 1024).unwrap();
    }
    assert_eq!(channel.transfer_queue_available().unwrap(), 0);

    let err = channel
        .push_superpage(32 * 1024 * 1024, 1024 * 1024)
        .unwrap_err();
    assert!(matches!(err, roc_core::Error::QueueFull));

    // Drain one superpage, freeing a slot for the push that previously failed.
    let mut popped = false;
    for _ in 0..200 {
        channel.fill_superpages().unwrap();
        if channel.ready_queue_size().unwrap() > 0 {
            channel.pop_superpage().unwrap();
            popped = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(popped, "at least one of the 32 queued superpages should complete");

    channel.push_superpage(32 * 1024 * 1024, 1024 * 1024).unwrap();

    channel.stop_dma().unwrap();
    channel.close().unwrap();
}

#[test]
fn model_b_pushes_a_superpage_spanning_many_more_pages_than_descriptor_slots() {
    init_tracing();
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    let (_guard, path) = temp_buffer_path();
    let size = (4 * 1024 * 1024).to_string();
    let p = params(&[
        ("card-id", "2000"),
        ("channel", "0"),
        ("buffer-type", "file"),
        ("buffer-path", path.as_str()),
        ("buffer-size", size.as_str()),
        ("dma-page-size", "8192"),
        ("generator-enabled", "true"),
        ("data-source", "internal"),
    ]);

    let mut channel = ChannelBase::open(backend, p).unwrap();
    channel.start_dma().unwrap();
    // 1 MiB at an 8 KiB page size is 128 pages, far more than the 4
    // descriptor slots a link owns; this only completes if the engine
    // programs it onto the card incrementally across several polls.
    channel.push_superpage(0, 1024 * 1024).unwrap();

    let mut popped = None;
    for _ in 0..200 {
        channel.fill_superpages().unwrap();
        if channel.ready_queue_size().unwrap() > 0 {
            popped = Some(channel.pop_superpage().unwrap());
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let superpage = popped.expect("superpage should have arrived within the polling window");
    assert_eq!(superpage.offset, 0);
    assert_eq!(superpage.size, 1024 * 1024);
    assert_eq!(superpage.received, 1024 * 1024);
    assert!(superpage.ready);

    channel.stop_dma().unwrap();
    channel.close().unwrap();
}

#[test]
fn second_open_of_same_channel_fails_while_first_is_held() {
    let backend: Arc<dyn roc_core::CardBackend> = Arc::new(SimBackend::new(CardFamily::A));
    let (_guard, path) = temp_buffer_path();
    let size = (4 * 1024 * 1024).to_string();
    let p = || {
        params(&[
            ("card-id", "1000"),
            ("channel", "1"),
            ("buffer-type", "file"),
            ("buffer-path", path.as_str()),
            ("buffer-size", size.as_str()),
        ])
    };

    let first = ChannelBase::open(Arc::clone(&backend), p()).unwrap();
    let err = ChannelBase::open(Arc::clone(&backend), p()).unwrap_err();
    assert!(matches!(err, roc_core::Error::FileLocked));
    drop(first);

    // Once the first is closed, opening again should succeed.
    let second = ChannelBase::open(backend, p()).unwrap();
    second.close().unwrap();
}

#[test]
fn model_a_arrival_error_surfaces_partial_superpage_and_later_pushes_still_work() {
    init_tracing();
    let backend = Arc::new(SimBackend::new(CardFamily::A));
    backend.card().inject_arrival_error();
    let (_guard, path) = temp_buffer_path();
    let size = (4 * 1024 * 1024).to_string();
    let p = params(&[
        ("card-id", "1000"),
        ("channel", "0"),
        ("buffer-type", "file"),
        ("buffer-path", path.as_str()),
        ("buffer-size", size.as_str()),
        ("dma-page-size", "8192"),
    ]);

    let mut channel = ChannelBase::open(backend, p).unwrap();
    channel.start_dma().unwrap();
    // 1 MiB is model A's minimum push granularity; at the default 8 KiB
    // page size this needs 128 page arrivals, so the injected error on the
    // first one aborts the superpage well short of full.
    channel.push_superpage(0, 1024 * 1024).unwrap();

    let mut popped = None;
    for _ in 0..200 {
        channel.fill_superpages().unwrap();
        if channel.ready_queue_size().unwrap() > 0 {
            popped = Some(channel.pop_superpage().unwrap());
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let aborted = popped.expect("aborted superpage should still reach the ready queue");
    assert!(aborted.ready);
    assert!(
        aborted.received < aborted.size,
        "an arrival error must leave the superpage short of its full size"
    );

    // The channel keeps working after the error: a later superpage pops
    // normally.
    channel.push_superpage(1024 * 1024, 1024 * 1024).unwrap();
    let mut popped = None;
    for _ in 0..200 {
        channel.fill_superpages().unwrap();
        if channel.ready_queue_size().unwrap() > 0 {
            popped = Some(channel.pop_superpage().unwrap());
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let recovered = popped.expect("superpage after the error should arrive normally");
    assert_eq!(recovered.received, recovered.size);

    channel.stop_dma().unwrap();
    channel.close().unwrap();
}

#[test]
fn reset_channel_is_rejected_while_started_and_succeeds_once_stopped() {
    init_tracing();
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    let p = params(&[("card-id", "2000"), ("channel", "0")]);
    let mut channel = ChannelBase::open(backend, p).unwrap();

    channel.start_dma().unwrap();
    let err = channel
        .reset_channel(roc_core::ResetLevel::InternalDiuSiu)
        .unwrap_err();
    assert!(matches!(err, roc_core::Error::BadState { .. }));

    channel.stop_dma().unwrap();
    let start = std::time::Instant::now();
    channel
        .reset_channel(roc_core::ResetLevel::InternalDiuSiu)
        .unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(100),
        "InternalDiuSiu must take at least the mandated settle delay"
    );

    channel.close().unwrap();
}

#[test]
fn model_b_reports_temperature_and_firmware_info() {
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    let p = params(&[("card-id", "2000"), ("channel", "0")]);
    let channel = ChannelBase::open(backend, p).unwrap();

    let temp = channel.temperature().unwrap();
    assert!((temp - 81.28).abs() < 0.01, "got {temp}");

    let fw = channel.firmware_info().unwrap();
    assert_eq!(fw.major, 1);

    channel.close().unwrap();
}

#[test]
fn model_b_bad_firmware_magic_is_rejected() {
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    backend.card().set_firmware_raw(0x01_123456);
    let p = params(&[("card-id", "2000"), ("channel", "0")]);
    let channel = ChannelBase::open(backend, p).unwrap();

    let err = channel.firmware_info().unwrap_err();
    assert!(matches!(err, roc_core::Error::FirmwareMagicMismatch { .. }));

    channel.close().unwrap();
}

#[test]
fn model_a_has_no_temperature_or_firmware_sensor() {
    let backend = Arc::new(SimBackend::new(CardFamily::A));
    let p = params(&[("card-id", "1000"), ("channel", "0")]);
    let channel = ChannelBase::open(backend, p).unwrap();

    assert!(matches!(channel.temperature().unwrap_err(), roc_core::Error::Unavailable));
    assert!(matches!(channel.firmware_info().unwrap_err(), roc_core::Error::Unavailable));

    channel.close().unwrap();
}

#[test]
fn invalid_channel_number_is_rejected_for_model_b() {
    let backend = Arc::new(SimBackend::new(CardFamily::B));
    let p = params(&[("card-id", "2000"), ("channel", "3")]);
    let err = ChannelBase::open(backend, p).unwrap_err();
    assert!(matches!(err, roc_core::Error::InvalidChannel { channel: 3 }));
}

#[test]
fn unknown_card_id_is_rejected() {
    let backend = Arc::new(SimBackend::new(CardFamily::A));
    let p = params(&[("card-id", "9999999"), ("channel", "0")]);
    let err = ChannelBase::open(backend, p).unwrap_err();
    assert!(matches!(err, roc_core::Error::CardNotFound { .. }));
}
