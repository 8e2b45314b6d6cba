use crate::actions::{ActionDesc, Symbol};
use crate::audio::LoopTrack;
use crate::events::WaitHandle;
use crate::session::Session;
use crate::sync::{MidiClock, PeerState, Transport};
use crate::timing::{SchedulerMessage, SchedulerSnapshot, TrackScheduler, WaitUnit};
use crate::track::{LooperTrack, TrackMode};
use arc_swap::ArcSwap;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{Receiver, Sender};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum EngineCommand {
    LoadSession(PathBuf),
    ReloadSession(Session),
    /// Start the audio engine (build streams if needed).
    Start,
    /// Tear the streams down.
    Stop,
    /// Perform a looper action, on its scope track or the focused one.
    Do(ActionDesc),
    /// Schedule a script wait against a track's scheduler.
    ScheduleWait {
        track: usize,
        unit: WaitUnit,
        handle: WaitHandle,
    },
    FocusTrack(usize),
    SetTempo(f32),
    TransportStart,
    TransportStop,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    SessionLoaded { session: Session },
    EngineState { running: bool },
    Error { message: String },
}

/// Per-track projection for the UI, rebuilt from the audio thread every few
/// blocks and published through an arc-swap.
#[derive(Debug, Clone, Default)]
pub struct TrackUiState {
    pub number: usize,
    pub name: String,
    pub mode: TrackMode,
    pub frame: u64,
    pub loop_frames: u64,
    pub cycle_frames: u64,
    pub loop_index: usize,
    pub loop_count: usize,
    pub overdub: bool,
    pub mute: bool,
    pub reverse: bool,
    pub events: SchedulerSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub tracks: Vec<TrackUiState>,
    pub alerts: Vec<&'static str>,
    pub transport_running: bool,
    pub tempo: f32,
    pub beat: u64,
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    pub snapshot: Arc<ArcSwap<EngineSnapshot>>,
    pub midi_clock: Arc<MidiClock>,
}

pub fn spawn_engine() -> EngineHandle {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();
    let snapshot = Arc::new(ArcSwap::from_pointee(EngineSnapshot::default()));
    let midi_clock = Arc::new(MidiClock::default());

    let snapshot_engine = snapshot.clone();
    let clock_engine = midi_clock.clone();
    std::thread::spawn(move || {
        engine_thread(command_rx, update_tx, snapshot_engine, clock_engine);
    });

    EngineHandle {
        command_tx,
        update_rx,
        snapshot,
        midi_clock,
    }
}

#[derive(Debug, Error)]
enum EngineError {
    #[error("no output device")]
    NoOutputDevice,
    #[error("audio setup failed: {0}")]
    Stream(String),
}

/// Control messages crossing from the engine thread into the audio callback
/// over the SPSC ring.
#[derive(Debug)]
enum AudioMsg {
    Do(ActionDesc),
    Wait {
        track: usize,
        unit: WaitUnit,
        handle: WaitHandle,
    },
    Session(Box<Session>),
    Focus(usize),
    SetTempo(f32),
    TransportStart,
    TransportStop,
}

struct TrackUnit {
    scheduler: TrackScheduler,
    track: LoopTrack,
}

/// The audio-thread half of the engine: per-track schedulers and loop
/// tracks, the transport, and the message plumbing. Owns no locks; all
/// control arrives over the ring.
struct LooperEngine {
    units: Vec<TrackUnit>,
    transport: Transport,
    session: Session,
    msgs: HeapCons<AudioMsg>,
    input_rx: Option<HeapCons<f32>>,
    input_block: Vec<f32>,
    peers: Vec<PeerState>,
    routed: Vec<(usize, SchedulerMessage)>,
    alerts: Vec<&'static str>,
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    focused: usize,
    channels: usize,
    blocks: u64,
}

const BLOCKS_PER_SNAPSHOT: u64 = 8;

impl LooperEngine {
    fn new(
        session: Session,
        msgs: HeapCons<AudioMsg>,
        input_rx: Option<HeapCons<f32>>,
        snapshot: Arc<ArcSwap<EngineSnapshot>>,
        midi_clock: Arc<MidiClock>,
        channels: usize,
        block_frames: usize,
    ) -> Self {
        let sample_rate = session.sample_rate as f32;
        let transport = Transport::new(
            sample_rate,
            session.tempo,
            session.beats_per_bar,
            midi_clock,
        );
        let mut engine = Self {
            units: Vec::new(),
            transport,
            session: Session {
                tracks: Vec::new(),
                ..session.clone()
            },
            msgs,
            input_rx,
            input_block: vec![0.0; block_frames.max(64)],
            peers: Vec::with_capacity(16),
            routed: Vec::with_capacity(64),
            alerts: Vec::new(),
            snapshot,
            focused: 0,
            channels,
            blocks: 0,
        };
        engine.apply_session(session, block_frames.max(64));
        engine
    }

    fn apply_session(&mut self, session: Session, block_frames: usize) {
        self.transport.set_tempo(session.tempo);
        for (i, params) in session.tracks.iter().enumerate() {
            if i >= self.units.len() {
                self.units.push(TrackUnit {
                    scheduler: TrackScheduler::new(i, params.clone()),
                    track: LoopTrack::new(i, params, block_frames),
                });
            } else {
                self.units[i].scheduler.set_params(params.clone());
                self.units[i].track.apply_params(params);
            }
            let bar = ((60.0 / session.tempo) * session.sample_rate as f32) as u64
                * session.beats_per_bar as u64;
            self.units[i]
                .track
                .set_goal_frames(bar * params.auto_record_cycles.max(1) as u64);
        }
        self.session = session;
    }

    fn rebuild_peers(&mut self) {
        self.peers.clear();
        for (i, unit) in self.units.iter().enumerate() {
            let params = unit.scheduler.params();
            self.peers.push(PeerState {
                frames: unit.track.loop_frames(),
                frame: unit.track.frame(),
                cycle_frames: unit.track.cycle_frames(),
                mode: unit.track.mode(),
                track_sync_master: params.track_sync_master,
                out_sync_master: params.out_sync_master,
                focused: i == self.focused,
            });
        }
    }

    fn handle_msg(&mut self, msg: AudioMsg) {
        match msg {
            AudioMsg::Do(desc) => self.dispatch_action(desc),
            AudioMsg::Wait { track, unit, handle } => {
                if let Some(u) = self.units.get_mut(track) {
                    u.scheduler.schedule_wait(&u.track, unit, handle);
                } else {
                    warn!(track, "wait for an unknown track");
                    handle.cancel();
                }
            }
            AudioMsg::Session(session) => {
                let block = self.input_block.len();
                self.apply_session(*session, block);
            }
            AudioMsg::Focus(track) => {
                if track < self.units.len() {
                    self.focused = track;
                }
            }
            AudioMsg::SetTempo(tempo) => self.transport.set_tempo(tempo),
            AudioMsg::TransportStart => self.transport.start(),
            AudioMsg::TransportStop => self.transport.stop(),
        }
    }

    fn dispatch_action(&mut self, desc: ActionDesc) {
        if desc.symbol == Symbol::FocusLock {
            let target = desc.track.unwrap_or(self.focused);
            if target < self.units.len() {
                self.focused = target;
            }
            return;
        }
        self.rebuild_peers();
        if desc.symbol.is_global() {
            for i in 0..self.units.len() {
                let unit = &mut self.units[i];
                unit.scheduler
                    .do_action(&mut unit.track, &mut self.transport, &self.peers, &desc);
            }
            return;
        }
        let target = desc.track.unwrap_or(self.focused);
        let Some(unit) = self.units.get_mut(target) else {
            warn!(target, "action for an unknown track");
            return;
        };
        unit.scheduler
            .do_action(&mut unit.track, &mut self.transport, &self.peers, &desc);
    }

    /// One audio callback worth of work: drain control, advance every track
    /// in lockstep with its event list, route cross-track notifications in
    /// track order, mix.
    fn process(&mut self, output: &mut [f32]) {
        let frames = if self.channels > 0 {
            output.len() / self.channels
        } else {
            0
        };
        output.fill(0.0);
        if frames == 0 {
            return;
        }

        while let Some(msg) = self.msgs.try_pop() {
            self.handle_msg(msg);
        }

        // Pull this block's live input; missing samples are silence.
        self.input_block.resize(frames, 0.0);
        for sample in self.input_block.iter_mut() {
            *sample = self
                .input_rx
                .as_mut()
                .and_then(|rx| rx.try_pop())
                .unwrap_or(0.0);
        }

        self.transport.begin_block(frames as u64);
        self.rebuild_peers();

        for i in 0..self.units.len() {
            let unit = &mut self.units[i];
            unit.track.begin_block(&self.input_block);
            unit.scheduler
                .advance(&mut unit.track, &mut self.transport, &self.peers, frames as u64);
        }

        self.route_messages();

        for unit in &self.units {
            let track_out = unit.track.output();
            for frame in 0..frames.min(track_out.len()) {
                let sample = track_out[frame];
                for ch in 0..self.channels {
                    output[frame * self.channels + ch] += sample;
                }
            }
        }

        self.blocks += 1;
        if self.blocks % BLOCKS_PER_SNAPSHOT == 0 {
            self.publish_snapshot();
        }
    }

    /// Deliver outbox messages in track order. Notifications go to the
    /// tracks that follow the source (correlated Follower notes go to
    /// everyone; the correlation id picks the receiver). Messages produced
    /// during delivery ride to the next block.
    fn route_messages(&mut self) {
        self.routed.clear();
        let mut scratch = Vec::new();
        for (i, unit) in self.units.iter_mut().enumerate() {
            unit.scheduler.drain_outbox(&mut scratch);
            for msg in scratch.drain(..) {
                self.routed.push((i, msg));
            }
        }
        let routed = std::mem::take(&mut self.routed);
        for (source, msg) in &routed {
            match msg {
                SchedulerMessage::Notify(note) => {
                    for j in 0..self.units.len() {
                        if j == *source {
                            continue;
                        }
                        if let Some(target) = note.follower {
                            if target != j {
                                continue;
                            }
                        } else if note.id != crate::sync::NotificationId::Follower {
                            let follows = self.units[j]
                                .scheduler
                                .resolve_leader(&self.peers)
                                .is_some_and(|l| l == *source);
                            if !follows {
                                continue;
                            }
                        }
                        let unit = &mut self.units[j];
                        unit.scheduler.handle_notification(&mut unit.track, note);
                    }
                }
                SchedulerMessage::LeaderWait {
                    leader,
                    unit: quant,
                    event_id,
                } => {
                    if let Some(u) = self.units.get_mut(*leader) {
                        u.scheduler.schedule_follower_wait(&u.track, *quant, *event_id);
                    } else {
                        warn!(leader, "leader wait for an unknown track");
                    }
                }
                SchedulerMessage::Alert(message) => self.alerts.push(*message),
            }
        }
        self.routed = routed;
        self.routed.clear();
    }

    fn publish_snapshot(&mut self) {
        let tracks = self
            .units
            .iter()
            .enumerate()
            .map(|(i, unit)| TrackUiState {
                number: i,
                name: self
                    .session
                    .tracks
                    .get(i)
                    .map(|t| t.name.clone())
                    .unwrap_or_default(),
                mode: unit.scheduler.display_mode(&unit.track),
                frame: unit.track.frame(),
                loop_frames: unit.track.loop_frames(),
                cycle_frames: unit.track.cycle_frames(),
                loop_index: unit.track.loop_index(),
                loop_count: unit.track.loop_count(),
                overdub: unit.track.overdub_active(),
                mute: unit.track.mute_active(),
                reverse: unit.track.reverse_active(),
                events: unit.scheduler.snapshot(),
            })
            .collect();
        self.snapshot.store(Arc::new(EngineSnapshot {
            tracks,
            alerts: std::mem::take(&mut self.alerts),
            transport_running: self.transport.running(),
            tempo: self.transport.tempo(),
            beat: self.transport.beat(),
        }));
    }
}

struct EngineState {
    session: Session,
    session_path: Option<PathBuf>,
    msg_tx: Option<HeapProd<AudioMsg>>,
    output_stream: Option<cpal::Stream>,
    input_stream: Option<cpal::Stream>,
    running: bool,
}

fn engine_thread(
    command_rx: Receiver<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    midi_clock: Arc<MidiClock>,
) {
    let mut state = EngineState {
        session: Session::default(),
        session_path: None,
        msg_tx: None,
        output_stream: None,
        input_stream: None,
        running: false,
    };

    let push = |state: &mut EngineState, msg: AudioMsg| {
        if let Some(tx) = state.msg_tx.as_mut() {
            if tx.try_push(msg).is_err() {
                warn!("audio message ring full, dropping");
            }
        }
    };

    loop {
        match command_rx.recv() {
            Ok(EngineCommand::LoadSession(path)) => match Session::load(&path) {
                Ok(session) => {
                    info!(name = %session.name, "session loaded");
                    state.session_path = Some(path);
                    let _ = update_tx.send(EngineUpdate::SessionLoaded {
                        session: session.clone(),
                    });
                    if state.running {
                        push(&mut state, AudioMsg::Session(Box::new(session.clone())));
                    }
                    state.session = session;
                }
                Err(e) => {
                    let _ = update_tx.send(EngineUpdate::Error {
                        message: format!("Failed to load session: {}", e),
                    });
                }
            },
            Ok(EngineCommand::ReloadSession(session)) => {
                if state.running {
                    push(&mut state, AudioMsg::Session(Box::new(session.clone())));
                }
                state.session = session;
            }
            Ok(EngineCommand::Start) => {
                if state.output_stream.is_none() {
                    match setup_audio(&state.session, snapshot.clone(), midi_clock.clone()) {
                        Ok((output_stream, input_stream, msg_tx)) => {
                            state.output_stream = Some(output_stream);
                            state.input_stream = input_stream;
                            state.msg_tx = Some(msg_tx);
                            state.running = true;
                            let _ = update_tx.send(EngineUpdate::EngineState { running: true });
                        }
                        Err(e) => {
                            let _ = update_tx.send(EngineUpdate::Error {
                                message: format!("Failed to start audio: {}", e),
                            });
                        }
                    }
                } else {
                    state.running = true;
                    let _ = update_tx.send(EngineUpdate::EngineState { running: true });
                }
            }
            Ok(EngineCommand::Stop) => {
                state.output_stream = None;
                state.input_stream = None;
                state.msg_tx = None;
                state.running = false;
                let _ = update_tx.send(EngineUpdate::EngineState { running: false });
            }
            Ok(EngineCommand::Do(desc)) => push(&mut state, AudioMsg::Do(desc)),
            Ok(EngineCommand::ScheduleWait {
                track,
                unit,
                handle,
            }) => {
                if state.running {
                    push(&mut state, AudioMsg::Wait { track, unit, handle });
                } else {
                    // Nothing will ever fire it; don't leave the waiter hanging.
                    handle.cancel();
                }
            }
            Ok(EngineCommand::FocusTrack(track)) => push(&mut state, AudioMsg::Focus(track)),
            Ok(EngineCommand::SetTempo(tempo)) => {
                state.session.tempo = tempo;
                push(&mut state, AudioMsg::SetTempo(tempo));
            }
            Ok(EngineCommand::TransportStart) => push(&mut state, AudioMsg::TransportStart),
            Ok(EngineCommand::TransportStop) => push(&mut state, AudioMsg::TransportStop),
            Err(crossbeam::channel::RecvError) => break,
        }
    }
}

type AudioSetup = (cpal::Stream, Option<cpal::Stream>, HeapProd<AudioMsg>);

fn setup_audio(
    session: &Session,
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    midi_clock: Arc<MidiClock>,
) -> Result<AudioSetup, EngineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(EngineError::NoOutputDevice)?;
    let config = device
        .default_output_config()
        .map_err(|e| EngineError::Stream(e.to_string()))?;
    let stream_config: cpal::StreamConfig = config.into();
    let num_channels = stream_config.channels as usize;

    let msg_ring = HeapRb::<AudioMsg>::new(1024);
    let (msg_tx, msg_rx) = msg_ring.split();

    // Live input is optional; the engine runs (and loops silence) without it.
    let input_ring = HeapRb::<f32>::new(session.sample_rate as usize);
    let (mut input_tx, input_rx) = input_ring.split();
    let input_stream = host.default_input_device().and_then(|input_device| {
        let input_config: cpal::StreamConfig =
            input_device.default_input_config().ok()?.into();
        let in_channels = input_config.channels as usize;
        let stream = input_device
            .build_input_stream(
                &input_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(in_channels.max(1)) {
                        let mono = frame.iter().sum::<f32>() / in_channels.max(1) as f32;
                        let _ = input_tx.try_push(mono);
                    }
                },
                |err| error!("input stream error: {}", err),
                None,
            )
            .ok()?;
        stream.play().ok()?;
        Some(stream)
    });
    if input_stream.is_none() {
        info!("no input device, looping silence");
    }

    info!(
        channels = num_channels,
        sample_rate = session.sample_rate,
        "audio output opened"
    );

    let mut engine = LooperEngine::new(
        session.clone(),
        msg_rx,
        input_stream.as_ref().map(|_| input_rx),
        snapshot,
        midi_clock,
        num_channels,
        256,
    );

    let output_stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                engine.process(data);
            },
            |err| error!("output stream error: {}", err),
            None,
        )
        .map_err(|e| EngineError::Stream(e.to_string()))?;
    output_stream
        .play()
        .map_err(|e| EngineError::Stream(e.to_string()))?;

    debug!("audio engine running");
    Ok((output_stream, input_stream, msg_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::LeaderKind;

    fn test_engine(session: Session) -> (LooperEngine, HeapProd<AudioMsg>) {
        let ring = HeapRb::<AudioMsg>::new(64);
        let (tx, rx) = ring.split();
        let engine = LooperEngine::new(
            session,
            rx,
            None,
            Arc::new(ArcSwap::from_pointee(EngineSnapshot::default())),
            Arc::new(MidiClock::default()),
            2,
            64,
        );
        (engine, tx)
    }

    fn two_track_session() -> Session {
        let mut session = Session::default();
        session.tracks.truncate(2);
        session
    }

    #[test]
    fn actions_route_to_the_focused_track() {
        let (mut engine, mut tx) = test_engine(two_track_session());
        tx.try_push(AudioMsg::Focus(1)).unwrap();
        tx.try_push(AudioMsg::Do(ActionDesc::new(Symbol::Record)))
            .unwrap();

        let mut out = vec![0.0f32; 128];
        engine.process(&mut out);

        assert_eq!(engine.units[1].track.mode(), TrackMode::Record);
        assert_eq!(engine.units[0].track.mode(), TrackMode::Reset);
    }

    #[test]
    fn global_actions_hit_every_track() {
        let (mut engine, mut tx) = test_engine(two_track_session());
        tx.try_push(AudioMsg::Do(ActionDesc::new(Symbol::Record)))
            .unwrap();
        let mut out = vec![0.0f32; 128];
        engine.process(&mut out);
        assert_eq!(engine.units[0].track.mode(), TrackMode::Record);

        tx.try_push(AudioMsg::Do(ActionDesc::new(Symbol::GlobalReset)))
            .unwrap();
        engine.process(&mut out);
        assert_eq!(engine.units[0].track.mode(), TrackMode::Reset);
        assert_eq!(engine.units[1].track.mode(), TrackMode::Reset);
    }

    #[test]
    fn followers_hear_the_leaders_loop_size() {
        let mut session = two_track_session();
        session.tracks[1].leader = LeaderKind::Track(0);
        let (mut engine, mut tx) = test_engine(session);

        // Record a loop on track 0: start, run a while, end.
        tx.try_push(AudioMsg::Do(ActionDesc::new(Symbol::Record)))
            .unwrap();
        let mut out = vec![0.0f32; 128];
        engine.process(&mut out);
        for _ in 0..10 {
            engine.process(&mut out);
        }
        tx.try_push(AudioMsg::Do(ActionDesc::new(Symbol::Record)))
            .unwrap();
        engine.process(&mut out);

        let frames = engine.units[0].track.loop_frames();
        assert!(frames > 0);
        // The follower saw the LoopSize notification.
        assert_eq!(engine.units[1].track.goal_frames(), frames);
    }

    #[test]
    fn wait_for_unknown_track_is_canceled() {
        let (mut engine, mut tx) = test_engine(two_track_session());
        let (handle, rx) = WaitHandle::new();
        tx.try_push(AudioMsg::Wait {
            track: 9,
            unit: WaitUnit::Cycle,
            handle,
        })
        .unwrap();
        let mut out = vec![0.0f32; 128];
        engine.process(&mut out);
        assert_eq!(
            rx.try_recv().unwrap(),
            crate::events::WaitOutcome::Canceled
        );
    }

    #[test]
    fn playback_mixes_into_every_channel() {
        let (mut engine, mut tx) = test_engine(two_track_session());
        tx.try_push(AudioMsg::Do(ActionDesc::new(Symbol::Record)))
            .unwrap();
        let mut out = vec![0.0f32; 128];
        engine.process(&mut out);
        tx.try_push(AudioMsg::Do(ActionDesc::new(Symbol::Record)))
            .unwrap();
        engine.process(&mut out);
        assert!(engine.units[0].track.loop_frames() > 0);

        // Silence in, silence out, but the mix path runs without touching
        // the other track.
        engine.process(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
