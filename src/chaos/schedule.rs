//! Fault Schedule Generator.
//!
//! A *fault window* is one `start`/`stop` bracket separated by randomized
//! sleeps, optionally followed by one extra instantaneous fault:
//!
//! ```text
//! sleep(60..90s)  {info start}  sleep(60..90s)  {info stop}  [sleep(60..90s)  {info <extra>}]
//! ```
//!
//! [`FaultStream`] concatenates fresh windows forever and is pulled lazily, one
//! window at a time. [`Schedule`] merges it with the client workload on a
//! virtual timeline, cuts the result at the time limit and then appends the
//! terminate sequence so the cluster is always left with faults stopped and
//! clocks reset.
//!
//! # Ordering guarantees
//!
//! 1. Within a window `start` precedes `stop`.
//! 2. The extra operation, if any, strictly follows `stop`.
//! 3. Steps are emitted in non-decreasing `at` order.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Serializer};
use serde_json::json;

use super::operation::{Action, Operation};
use super::timing::Scale;

/// Base length of each sleep inside a window.
pub const WINDOW_SLEEP: Duration = Duration::from_secs(60);

/// Upper bound (exclusive, seconds) of the random extension of each sleep.
pub const WINDOW_JITTER_SECS: u64 = 30;

/// Largest clock offset a bump or strobe applies, in milliseconds.
pub const MAX_CLOCK_DELTA_MS: i64 = 262_144;

/// Default mean gap between client operations.
pub const DEFAULT_CLIENT_STAGGER: Duration = Duration::from_millis(100);

/// Which optional faults may follow a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultOptions {
    pub decommission: bool,
    pub bootstrap: bool,
    /// Clock reset and clock bump.
    pub clock: bool,
    pub clock_strobe: bool,
    pub scale: Scale,
}

impl FaultOptions {
    pub fn clock_enabled(&self) -> bool {
        self.clock || self.clock_strobe
    }

    /// The extra actions a window may end with.
    pub fn extra_actions(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.decommission {
            actions.push(Action::Decommission);
        }
        if self.bootstrap {
            actions.push(Action::Bootstrap);
        }
        if self.clock {
            actions.push(Action::ClockReset);
            actions.push(Action::ClockBump);
        }
        if self.clock_strobe {
            actions.push(Action::ClockStrobe);
        }
        actions
    }
}

/// One element of the fault stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Sleep(Duration),
    Op(Operation),
}

fn window_sleep<R: Rng + ?Sized>(opts: &FaultOptions, rng: &mut R) -> Event {
    let jitter = Duration::from_secs(rng.gen_range(0..WINDOW_JITTER_SECS));
    Event::Sleep(opts.scale.apply(WINDOW_SLEEP + jitter))
}

fn extra_operation<R: Rng + ?Sized>(opts: &FaultOptions, rng: &mut R) -> Option<Operation> {
    let action = *opts.extra_actions().choose(rng)?;
    let op = Operation::info(action);
    Some(match action {
        Action::ClockBump => {
            let magnitude = rng.gen_range(1..=MAX_CLOCK_DELTA_MS);
            let delta = if rng.gen_bool(0.5) { magnitude } else { -magnitude };
            op.with_payload(json!({ "delta_ms": delta }))
        }
        Action::ClockStrobe => op.with_payload(json!({
            "delta_ms": rng.gen_range(1..=MAX_CLOCK_DELTA_MS),
            "period_ms": rng.gen_range(1..=1000u64),
            "duration_s": rng.gen_range(1..=32u64),
        })),
        _ => op,
    })
}

/// Generate one fault window.
pub fn fault_window<R: Rng + ?Sized>(opts: &FaultOptions, rng: &mut R) -> Vec<Event> {
    let mut events = vec![
        window_sleep(opts, rng),
        Event::Op(Operation::info(Action::Start)),
        window_sleep(opts, rng),
        Event::Op(Operation::info(Action::Stop)),
    ];
    if let Some(extra) = extra_operation(opts, rng) {
        events.push(window_sleep(opts, rng));
        events.push(Event::Op(extra));
    }
    events
}

/// Infinite stream of independent fault windows.
pub struct FaultStream<R> {
    opts: FaultOptions,
    rng: R,
    pending: VecDeque<Event>,
}

impl<R: Rng> FaultStream<R> {
    pub fn new(opts: FaultOptions, rng: R) -> Self {
        FaultStream {
            opts,
            rng,
            pending: VecDeque::new(),
        }
    }
}

impl<R: Rng> Iterator for FaultStream<R> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.pending.is_empty() {
            self.pending.extend(fault_window(&self.opts, &mut self.rng));
        }
        self.pending.pop_front()
    }
}

/// Operations issued once the time limit is reached.
pub fn terminate_sequence(opts: &FaultOptions) -> Vec<Operation> {
    let mut ops = vec![Operation::info(Action::Stop)];
    if opts.clock_enabled() {
        ops.push(Operation::info(Action::ClockReset));
    }
    ops
}

/// Who executes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    Nemesis,
    Client,
}

/// Whether a step belongs to the time-bounded main phase or the terminate
/// sequence after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Main,
    Terminate,
}

/// A scheduled operation with its offset from the start of the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    #[serde(rename = "at_ms", serialize_with = "serialize_millis")]
    pub at: Duration,
    pub process: Process,
    pub phase: Phase,
    pub op: Operation,
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Knobs for [`Schedule`].
#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    pub faults: FaultOptions,
    /// Wall-clock bound of the main phase. Not scaled.
    pub time_limit: Duration,
    /// Mean gap between client operations; gaps are uniform in `[0, 2 * mean)`.
    pub client_stagger: Duration,
}

/// Client workload and fault stream merged on one timeline.
pub struct Schedule<C> {
    faults: FaultStream<StdRng>,
    clients: C,
    rng: StdRng,
    stagger: Duration,
    time_limit: Duration,
    nemesis_clock: Duration,
    client_clock: Duration,
    next_fault: Option<Step>,
    next_client: Option<Step>,
    main_done: bool,
    terminate: VecDeque<Operation>,
}

impl<C: Iterator<Item = Operation>> Schedule<C> {
    pub fn new(opts: &ScheduleOptions, clients: C, mut rng: StdRng) -> Self {
        let fault_rng = StdRng::seed_from_u64(rng.gen());
        Schedule {
            faults: FaultStream::new(opts.faults, fault_rng),
            clients,
            rng,
            stagger: opts.client_stagger,
            time_limit: opts.time_limit,
            nemesis_clock: Duration::ZERO,
            client_clock: Duration::ZERO,
            next_fault: None,
            next_client: None,
            main_done: false,
            terminate: terminate_sequence(&opts.faults).into(),
        }
    }

    /// Advance the nemesis timeline through sleeps to the next fault operation.
    fn pull_fault(&mut self) -> Option<Step> {
        for event in self.faults.by_ref() {
            match event {
                Event::Sleep(d) => self.nemesis_clock += d,
                Event::Op(op) => {
                    return Some(Step {
                        at: self.nemesis_clock,
                        process: Process::Nemesis,
                        phase: Phase::Main,
                        op,
                    })
                }
            }
        }
        None
    }

    fn pull_client(&mut self) -> Option<Step> {
        let op = self.clients.next()?;
        let bound = self.stagger.as_nanos().min(u64::MAX as u128 / 2) as u64 * 2;
        if bound > 0 {
            self.client_clock += Duration::from_nanos(self.rng.gen_range(0..bound));
        }
        Some(Step {
            at: self.client_clock,
            process: Process::Client,
            phase: Phase::Main,
            op,
        })
    }

    fn next_main(&mut self) -> Option<Step> {
        if self.next_fault.is_none() {
            self.next_fault = self.pull_fault();
        }
        if self.next_client.is_none() {
            self.next_client = self.pull_client();
        }
        let fault_first = match (&self.next_fault, &self.next_client) {
            (Some(f), Some(c)) => f.at <= c.at,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return None,
        };
        let step = if fault_first {
            self.next_fault.take()
        } else {
            self.next_client.take()
        };
        step.filter(|s| s.at <= self.time_limit)
    }
}

impl<C: Iterator<Item = Operation>> Iterator for Schedule<C> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        if !self.main_done {
            match self.next_main() {
                Some(step) => return Some(step),
                None => {
                    self.main_done = true;
                    self.next_fault = None;
                    self.next_client = None;
                }
            }
        }
        let op = self.terminate.pop_front()?;
        Some(Step {
            at: self.time_limit,
            process: Process::Nemesis,
            phase: Phase::Terminate,
            op,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::operation::OpKind;

    fn all_extras() -> FaultOptions {
        FaultOptions {
            decommission: true,
            bootstrap: true,
            clock: true,
            clock_strobe: true,
            scale: Scale::default(),
        }
    }

    fn reads() -> impl Iterator<Item = Operation> {
        std::iter::repeat_with(|| Operation::invoke(Action::Read))
    }

    #[test]
    fn test_window_without_extras_is_four_events() {
        let mut rng = StdRng::seed_from_u64(7);
        let opts = FaultOptions::default();
        for _ in 0..100 {
            let window = fault_window(&opts, &mut rng);
            assert_eq!(window.len(), 4);
            assert!(matches!(window[0], Event::Sleep(_)));
            assert_eq!(window[1], Event::Op(Operation::info(Action::Start)));
            assert!(matches!(window[2], Event::Sleep(_)));
            assert_eq!(window[3], Event::Op(Operation::info(Action::Stop)));
        }
    }

    #[test]
    fn test_window_sleeps_are_sixty_to_ninety_seconds() {
        let mut rng = StdRng::seed_from_u64(11);
        let stream = FaultStream::new(all_extras(), &mut rng);
        for event in stream.take(2_000) {
            if let Event::Sleep(d) = event {
                assert!(d >= Duration::from_secs(60) && d < Duration::from_secs(90), "{:?}", d);
            }
        }
    }

    #[test]
    fn test_window_sleeps_follow_scale() {
        let mut rng = StdRng::seed_from_u64(3);
        let opts = FaultOptions {
            scale: Scale::new(0.001),
            ..FaultOptions::default()
        };
        for event in fault_window(&opts, &mut rng) {
            if let Event::Sleep(d) = event {
                assert!(d >= Duration::from_millis(60) && d < Duration::from_millis(90));
            }
        }
    }

    #[test]
    fn test_window_extra_comes_from_enabled_set() {
        let mut rng = StdRng::seed_from_u64(5);
        let opts = FaultOptions {
            bootstrap: true,
            clock_strobe: true,
            ..FaultOptions::default()
        };
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let window = fault_window(&opts, &mut rng);
            assert_eq!(window.len(), 6);
            assert!(matches!(window[4], Event::Sleep(_)));
            match &window[5] {
                Event::Op(op) => {
                    assert_eq!(op.kind, OpKind::Info);
                    assert!(matches!(op.action, Action::Bootstrap | Action::ClockStrobe));
                    seen.insert(op.action);
                }
                other => panic!("expected an extra operation, got {:?}", other),
            }
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_clock_payloads() {
        let mut rng = StdRng::seed_from_u64(9);
        let opts = FaultOptions {
            clock: true,
            clock_strobe: true,
            ..FaultOptions::default()
        };
        for _ in 0..200 {
            let op = extra_operation(&opts, &mut rng).unwrap();
            match op.action {
                Action::ClockBump => {
                    let delta = op.payload["delta_ms"].as_i64().unwrap();
                    assert!(delta != 0 && delta.abs() <= MAX_CLOCK_DELTA_MS);
                }
                Action::ClockStrobe => {
                    assert!(op.payload["period_ms"].as_u64().unwrap() >= 1);
                    assert!(op.payload["duration_s"].as_u64().unwrap() <= 32);
                }
                Action::ClockReset => assert!(op.payload.is_null()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_fault_stream_brackets_are_well_formed() {
        let mut rng = StdRng::seed_from_u64(13);
        let ops: Vec<Action> = FaultStream::new(all_extras(), &mut rng)
            .take(5_000)
            .filter_map(|e| match e {
                Event::Op(op) => Some(op.action),
                Event::Sleep(_) => None,
            })
            .collect();

        let mut open = false;
        let mut extra_allowed = false;
        for action in ops {
            match action {
                Action::Start => {
                    assert!(!open, "start inside an open window");
                    open = true;
                    extra_allowed = false;
                }
                Action::Stop => {
                    assert!(open, "stop without start");
                    open = false;
                    extra_allowed = true;
                }
                _ => {
                    assert!(!open && extra_allowed, "extra {:?} outside its slot", action);
                    extra_allowed = false;
                }
            }
        }
    }

    #[test]
    fn test_terminate_sequence() {
        assert_eq!(
            terminate_sequence(&FaultOptions::default()),
            vec![Operation::info(Action::Stop)]
        );
        let clocky = FaultOptions {
            clock_strobe: true,
            ..FaultOptions::default()
        };
        assert_eq!(
            terminate_sequence(&clocky),
            vec![Operation::info(Action::Stop), Operation::info(Action::ClockReset)]
        );
    }

    #[test]
    fn test_schedule_is_bounded_ordered_and_terminated() {
        let opts = ScheduleOptions {
            faults: all_extras(),
            time_limit: Duration::from_secs(900),
            client_stagger: Duration::from_secs(1),
        };
        let steps: Vec<Step> = Schedule::new(&opts, reads(), StdRng::seed_from_u64(42)).collect();

        assert!(steps.windows(2).all(|w| w[0].at <= w[1].at));
        assert!(steps.iter().all(|s| s.at <= opts.time_limit));
        assert!(steps.iter().any(|s| s.process == Process::Client));
        assert!(steps
            .iter()
            .any(|s| s.process == Process::Nemesis && s.op.action == Action::Start));

        let tail: Vec<&Step> = steps.iter().filter(|s| s.phase == Phase::Terminate).collect();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].op.action, Action::Stop);
        assert_eq!(tail[1].op.action, Action::ClockReset);
        assert_eq!(steps.last().unwrap().phase, Phase::Terminate);
    }

    #[test]
    fn test_schedule_is_reproducible_with_a_seed() {
        let opts = ScheduleOptions {
            faults: all_extras(),
            time_limit: Duration::from_secs(600),
            client_stagger: Duration::from_millis(500),
        };
        let a: Vec<Step> = Schedule::new(&opts, reads(), StdRng::seed_from_u64(1)).collect();
        let b: Vec<Step> = Schedule::new(&opts, reads(), StdRng::seed_from_u64(1)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_schedule_with_finite_clients_still_runs_faults() {
        let opts = ScheduleOptions {
            faults: FaultOptions::default(),
            time_limit: Duration::from_secs(400),
            client_stagger: Duration::from_millis(10),
        };
        let clients = std::iter::repeat_with(|| Operation::invoke(Action::Write)).take(3);
        let steps: Vec<Step> = Schedule::new(&opts, clients, StdRng::seed_from_u64(2)).collect();

        assert_eq!(steps.iter().filter(|s| s.process == Process::Client).count(), 3);
        // 400s fits at least two complete windows of at most 180s each.
        let starts = steps
            .iter()
            .filter(|s| s.phase == Phase::Main && s.op.action == Action::Start)
            .count();
        assert!(starts >= 2);
    }

    #[test]
    fn test_step_json() {
        let step = Step {
            at: Duration::from_millis(1500),
            process: Process::Nemesis,
            phase: Phase::Main,
            op: Operation::info(Action::Start),
        };
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({
                "at_ms": 1500,
                "process": "nemesis",
                "phase": "main",
                "op": {"kind": "info", "action": "start", "payload": null}
            })
        );
    }
}
