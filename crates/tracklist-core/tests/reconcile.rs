use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracklist_core::backend::memory::{MemoryBackend, MemoryConfig, PlaylistSeed};
use tracklist_core::dispatcher::Dispatcher;
use tracklist_core::{
    Backend, BackendError, BridgeConfig, EntityRef, Item, Operation, Reply, Request, Response,
    Status, WakeSignal,
};

const URI: &str = "spotify:user:dana:playlist:sunday";

fn entity() -> EntityRef {
    EntityRef::parse(URI).unwrap()
}

fn items(ids: &str) -> Vec<Item> {
    ids.chars()
        .map(|c| Item::parse(&format!("spotify:track:{c}")).unwrap())
        .collect()
}

struct Harness {
    dispatcher: Dispatcher<MemoryBackend>,
}

impl Harness {
    fn new(initial: &str, memory: MemoryConfig, bridge: BridgeConfig) -> Self {
        let seed = PlaylistSeed::new(entity(), "Sunday")
            .with_creator("dana")
            .with_tracks(items(initial));
        let backend = MemoryBackend::new(WakeSignal::new(), memory).with_playlist(seed);
        let mut dispatcher = Dispatcher::new(backend, bridge);
        dispatcher.backend_mut().login();
        dispatcher.pump();
        assert!(dispatcher.backend().is_logged_in());
        Self { dispatcher }
    }

    fn with_defaults(initial: &str) -> Self {
        Self::new(initial, MemoryConfig::default(), BridgeConfig::default())
    }

    fn send(&mut self, operation: Operation) -> oneshot::Receiver<Response> {
        let (reply, rx) = Reply::channel();
        self.dispatcher.handle(Request::new(URI, operation), reply);
        rx
    }

    fn pump_until(&mut self, rx: &mut oneshot::Receiver<Response>) -> Response {
        for _ in 0..200 {
            if let Ok(response) = rx.try_recv() {
                return response;
            }
            self.dispatcher.pump();
        }
        panic!("request was never answered");
    }

    fn live(&self) -> Vec<Item> {
        self.dispatcher.backend().items(&entity()).unwrap().to_vec()
    }
}

fn view_items(response: &Response) -> Vec<Item> {
    assert_eq!(response.status, Status::Ok, "{:?}", response.body);
    response.view().expect("playlist body").items.clone()
}

#[test_timeout::timeout(5)]
fn unloaded_playlist_is_answered_only_after_it_loads() {
    let mut harness = Harness::new(
        "AB",
        MemoryConfig {
            load_delay_ticks: 3,
            ..MemoryConfig::default()
        },
        BridgeConfig::default(),
    );
    let mut rx = harness.send(Operation::Get);

    harness.dispatcher.pump();
    harness.dispatcher.pump();
    assert!(rx.try_recv().is_err());
    assert_eq!(harness.dispatcher.parked(), 1);

    harness.dispatcher.pump();
    let response = rx.try_recv().expect("answered once loaded");
    assert_eq!(view_items(&response), items("AB"));
    let view = response.view().unwrap();
    assert_eq!(view.title, "Sunday");
    assert_eq!(view.creator, "dana");
}

#[test_timeout::timeout(5)]
fn loaded_playlist_takes_the_same_path() {
    let mut harness = Harness::with_defaults("AB");
    let mut first = harness.send(Operation::Get);
    harness.pump_until(&mut first);

    let mut second = harness.send(Operation::Get);
    let response = second.try_recv().expect("answered without pumping");
    assert_eq!(view_items(&response), items("AB"));
    assert_eq!(harness.dispatcher.parked(), 0);
    assert_eq!(harness.dispatcher.backend().open_handles(), 0);
}

#[test_timeout::timeout(5)]
fn patch_reconciles_to_the_desired_list() {
    let mut harness = Harness::with_defaults("ABC");
    let mut rx = harness.send(Operation::Patch {
        desired: items("ACD"),
    });
    let response = harness.pump_until(&mut rx);
    assert_eq!(view_items(&response), items("ACD"));
    assert_eq!(harness.live(), items("ACD"));
    assert_eq!(harness.dispatcher.backend().pending_updates(&entity()), 0);
}

#[test_timeout::timeout(5)]
fn patch_recomputes_after_a_concurrent_edit() {
    let mut harness = Harness::new(
        "ABC",
        MemoryConfig {
            load_delay_ticks: 1,
            settle_delay_ticks: 2,
            ..MemoryConfig::default()
        },
        BridgeConfig::default(),
    );
    let mut rx = harness.send(Operation::Patch {
        desired: items("ACD"),
    });

    // Load completes and the first operation (drop B) goes out.
    harness.dispatcher.pump();
    assert_eq!(harness.live(), items("AC"));

    harness
        .dispatcher
        .backend_mut()
        .external_insert(&entity(), 1, &items("X"))
        .unwrap();
    assert_eq!(harness.live(), items("AXC"));

    let response = harness.pump_until(&mut rx);
    assert_eq!(view_items(&response), items("ACD"));
    assert_eq!(harness.live(), items("ACD"));
}

#[test_timeout::timeout(5)]
fn patches_on_one_playlist_do_not_interleave() {
    let mut harness = Harness::new(
        "ABC",
        MemoryConfig {
            settle_delay_ticks: 2,
            ..MemoryConfig::default()
        },
        BridgeConfig::default(),
    );
    let mut first = harness.send(Operation::Patch {
        desired: items("ABCDE"),
    });
    let mut second = harness.send(Operation::Patch {
        desired: items("E"),
    });

    let first_response = harness.pump_until(&mut first);
    assert_eq!(view_items(&first_response), items("ABCDE"));
    assert!(
        second.try_recv().is_err(),
        "second patch must wait for the first"
    );

    let second_response = harness.pump_until(&mut second);
    assert_eq!(view_items(&second_response), items("E"));
    assert_eq!(harness.live(), items("E"));
    assert_eq!(harness.dispatcher.backend().open_handles(), 0);
}

#[test_timeout::timeout(5)]
fn add_and_remove_wait_for_settlement() {
    let mut harness = Harness::with_defaults("AB");
    let mut rx = harness.send(Operation::AddItems {
        index: 1,
        items: items("XY"),
    });
    assert_eq!(view_items(&harness.pump_until(&mut rx)), items("AXYB"));

    let mut rx = harness.send(Operation::RemoveItems { index: 0, count: 2 });
    assert_eq!(view_items(&harness.pump_until(&mut rx)), items("YB"));
}

#[test_timeout::timeout(5)]
fn empty_additions_and_patches_return_the_current_view() {
    let mut harness = Harness::with_defaults("AB");
    let mut rx = harness.send(Operation::AddItems {
        index: 0,
        items: Vec::new(),
    });
    assert_eq!(view_items(&harness.pump_until(&mut rx)), items("AB"));

    let mut rx = harness.send(Operation::Patch {
        desired: Vec::new(),
    });
    assert_eq!(view_items(&harness.pump_until(&mut rx)), items("AB"));
    assert_eq!(harness.live(), items("AB"));
}

#[test_timeout::timeout(5)]
fn backend_rejections_pass_through_verbatim() {
    let mut harness = Harness::with_defaults("AB");

    let mut rx = harness.send(Operation::RemoveItems { index: 1, count: 5 });
    let response = harness.pump_until(&mut rx);
    assert_eq!(response.status, Status::BadRequest);
    assert_eq!(response.message(), Some("Invalid indices"));

    harness
        .dispatcher
        .backend_mut()
        .reject_next_mutation(BackendError::PermissionDenied);
    let mut rx = harness.send(Operation::Patch {
        desired: items("BA"),
    });
    let response = harness.pump_until(&mut rx);
    assert_eq!(response.status, Status::BadRequest);
    assert_eq!(response.message(), Some("Permission denied"));
    assert_eq!(harness.live(), items("AB"));
    assert_eq!(harness.dispatcher.backend().open_handles(), 0);
}

#[test_timeout::timeout(5)]
fn failed_load_answers_with_the_failure() {
    let mut harness = Harness::new(
        "AB",
        MemoryConfig {
            load_delay_ticks: 5,
            ..MemoryConfig::default()
        },
        BridgeConfig::default(),
    );
    let mut rx = harness.send(Operation::Get);
    harness
        .dispatcher
        .backend_mut()
        .fail_load(
            &entity(),
            BackendError::Other("Playlist is unavailable".into()),
        );
    let response = harness.pump_until(&mut rx);
    assert_eq!(response.status, Status::BadRequest);
    assert_eq!(response.message(), Some("Playlist is unavailable"));
}

#[test_timeout::timeout(5)]
fn later_requests_on_a_failed_playlist_get_the_failure_at_once() {
    let mut harness = Harness::new(
        "AB",
        MemoryConfig {
            load_delay_ticks: 5,
            ..MemoryConfig::default()
        },
        BridgeConfig::default(),
    );
    let mut first = harness.send(Operation::Get);
    harness
        .dispatcher
        .backend_mut()
        .fail_load(
            &entity(),
            BackendError::Other("Playlist is unavailable".into()),
        );
    harness.pump_until(&mut first);

    let mut second = harness.send(Operation::Get);
    let response = second.try_recv().expect("answered without pumping");
    assert_eq!(response.status, Status::BadRequest);
    assert_eq!(response.message(), Some("Playlist is unavailable"));
    assert_eq!(harness.dispatcher.parked(), 0);
    assert_eq!(harness.dispatcher.backend().open_handles(), 0);
}

#[test_timeout::timeout(5)]
fn oversized_removals_are_refused_before_touching_the_list() {
    let mut harness = Harness::with_defaults("ABC");
    for (index, count) in [(0, usize::MAX), (2, usize::MAX - 1), (1, 1 << 40)] {
        let mut rx = harness.send(Operation::RemoveItems { index, count });
        let response = harness.pump_until(&mut rx);
        assert_eq!(response.status, Status::BadRequest);
        assert_eq!(response.message(), Some("Invalid indices"));
    }
    assert_eq!(harness.live(), items("ABC"));
    assert_eq!(harness.dispatcher.parked(), 0);
    assert_eq!(harness.dispatcher.backend().open_handles(), 0);
}

#[test_timeout::timeout(5)]
fn stalled_playlist_times_out() {
    let mut harness = Harness::new(
        "AB",
        MemoryConfig {
            load_delay_ticks: 10_000,
            ..MemoryConfig::default()
        },
        BridgeConfig::default(),
    );
    let mut rx = harness.send(Operation::Get);
    harness.dispatcher.pump();
    assert!(rx.try_recv().is_err());

    harness
        .dispatcher
        .expire(Instant::now() + Duration::from_secs(61));
    let response = rx.try_recv().expect("timed out");
    assert_eq!(response.status, Status::GatewayTimeout);
    assert_eq!(harness.dispatcher.parked(), 0);
    assert_eq!(harness.dispatcher.backend().open_handles(), 0);
}

#[test_timeout::timeout(5)]
fn runaway_patch_reports_divergence() {
    let mut harness = Harness::new(
        "AB",
        MemoryConfig {
            load_delay_ticks: 1,
            settle_delay_ticks: 1,
            ..MemoryConfig::default()
        },
        BridgeConfig {
            max_patch_rounds: 1,
            ..BridgeConfig::default()
        },
    );
    let mut rx = harness.send(Operation::Patch {
        desired: items("BA"),
    });
    // Load and the first submission.
    harness.dispatcher.pump();
    harness
        .dispatcher
        .backend_mut()
        .external_insert(&entity(), 0, &items("Z"))
        .unwrap();

    let response = harness.pump_until(&mut rx);
    assert_eq!(response.status, Status::Internal);
    assert_eq!(response.message(), Some("patch did not converge"));
}
