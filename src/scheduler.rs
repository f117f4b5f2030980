//! Tick-driven workout execution engine
//!
//! The scheduler walks an ordered step list one second at a time and
//! announces step *transitions* through a callback; the initial step is
//! announced by the first `play()` instead, since no transition ever leads
//! into it. While running, a background task drives [`WorkoutScheduler::tick`]
//! at 1 Hz; `tick` is public so tests can advance time deterministically.
//!
//! The scheduler trusts its input: parsers guarantee a non-empty step list
//! with positive durations before a workout ever reaches it.

use crate::workout::{Workout, WorkoutStep};
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Callback invoked with the new step at every step transition
pub type StepCallback = Arc<dyn Fn(&WorkoutStep) + Send + Sync>;

struct ScheduleState {
    workout: Option<Arc<Workout>>,
    current_step_index: usize,
    time_in_step: u32,
    total_time: u32,
    is_paused: bool,
    is_finished: bool,
}

impl ScheduleState {
    fn new() -> Self {
        Self {
            workout: None,
            current_step_index: 0,
            time_in_step: 0,
            total_time: 0,
            is_paused: true,
            is_finished: false,
        }
    }

    fn reset_counters(&mut self) {
        self.current_step_index = 0;
        self.time_in_step = 0;
        self.total_time = 0;
        self.is_paused = true;
        self.is_finished = false;
    }

    fn is_running(&self) -> bool {
        self.workout.is_some() && !self.is_paused && !self.is_finished
    }
}

/// Workout playback engine
#[derive(Clone)]
pub struct WorkoutScheduler {
    state: Arc<Mutex<ScheduleState>>,
    on_step_change: StepCallback,
    tick_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkoutScheduler {
    pub fn new(on_step_change: StepCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScheduleState::new())),
            on_step_change,
            tick_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the loaded workout wholesale; `None` clears to idle
    ///
    /// All counters reset to zero and playback is paused either way.
    pub fn load_workout(&self, workout: Option<Workout>) {
        self.abort_tick_task();
        let mut state = self.state.lock().unwrap();
        match &workout {
            Some(w) => info!("Loaded workout \"{}\" ({} steps)", w.name, w.steps.len()),
            None => debug!("Cleared workout"),
        }
        state.workout = workout.map(Arc::new);
        state.reset_counters();
    }

    /// Resume (or begin) playback
    ///
    /// No-op without a workout or after finishing. The very first play after
    /// a load announces step 0, because ticking only announces transitions.
    pub fn play(&self) {
        let first_step = {
            let mut state = self.state.lock().unwrap();
            let Some(workout) = state.workout.clone() else {
                return;
            };
            if state.is_finished {
                return;
            }
            state.is_paused = false;
            (state.total_time == 0).then(|| workout.steps[0].clone())
        };

        if let Some(step) = first_step {
            (self.on_step_change)(&step);
        }
        self.spawn_tick_task();
    }

    /// Pause playback, preserving all counters
    pub fn pause(&self) {
        self.abort_tick_task();
        self.state.lock().unwrap().is_paused = true;
    }

    /// Reset playback to the start, keeping the loaded workout. Idempotent.
    pub fn stop(&self) {
        self.abort_tick_task();
        self.state.lock().unwrap().reset_counters();
    }

    /// Advance playback by one second
    ///
    /// Only acts while running. At a step boundary, either advances to the
    /// next step and announces it, or finishes and pauses.
    pub fn tick(&self) {
        let next_step = {
            let mut state = self.state.lock().unwrap();
            if !state.is_running() {
                return;
            }
            let workout = state.workout.as_ref().unwrap().clone();

            state.time_in_step += 1;
            state.total_time += 1;

            if state.time_in_step < workout.steps[state.current_step_index].duration_s {
                None
            } else if state.current_step_index + 1 < workout.steps.len() {
                state.current_step_index += 1;
                state.time_in_step = 0;
                Some(workout.steps[state.current_step_index].clone())
            } else {
                info!("Workout finished after {} s", state.total_time);
                state.is_finished = true;
                state.is_paused = true;
                None
            }
        };

        if let Some(step) = next_step {
            (self.on_step_change)(&step);
        }
    }

    pub fn workout(&self) -> Option<Arc<Workout>> {
        self.state.lock().unwrap().workout.clone()
    }

    pub fn current_step_index(&self) -> usize {
        self.state.lock().unwrap().current_step_index
    }

    pub fn time_in_step(&self) -> u32 {
        self.state.lock().unwrap().time_in_step
    }

    pub fn total_time(&self) -> u32 {
        self.state.lock().unwrap().total_time
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().is_paused
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().is_finished
    }

    /// True while a workout is loaded and actively playing
    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_running()
    }

    /// Drive `tick` at 1 Hz until playback leaves the running state
    fn spawn_tick_task(&self) {
        let mut tick_task = self.tick_task.lock().unwrap();
        if tick_task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let scheduler = self.clone();
        *tick_task = Some(tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;
                if !scheduler.is_active() {
                    break;
                }
                scheduler.tick();
            }
        }));
    }

    fn abort_tick_task(&self) {
        if let Some(task) = self.tick_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
