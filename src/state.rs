//! Engine instances.
//!
//! A [`State`] is one engine instance: a voice tree run by an audio driver,
//! a command queue and a time cursor, on top of a handle table. A master
//! instance creates the table; substates share it but get their own voice
//! tree, driver and time base.
//!
//! # Threads
//!
//! The table is only ever locked from the control side. The engine of each
//! instance runs wherever its driver puts it and is reached exclusively
//! through commands. Voice handles are tagged with the instance that
//! created them and rejected by every other instance.
//!
//! Substates are not meant to be driven from several threads at once; one
//! control thread per master family.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::bridge::{ControlLink, EngineReadback, create_bridge};
use crate::command::{Action, Command, InsertFn, Notice, TapFn, Ticks, XInsert};
use crate::compiler::{BankDef, Definition};
use crate::config::{Config, MAX_BUFFER, RenderSettings, StateFlags};
use crate::driver::{AudioDriver, BufferDriver, DriverSettings};
use crate::engine::{Engine, EngineSetup};
use crate::error::{Error, Result};
use crate::fixed::{Args, Fixed};
use crate::handle::Handle;
use crate::object::{InstanceId, ObjectKind, Payload, Record};
use crate::program::{GroupProgram, MAX_ENTRY_POINTS, Program, VoiceSetup};
use crate::property::Property;
use crate::scheduler::Timeline;
use crate::table::{HandleTable, Released, SharedTable, Teardown};
use crate::wave::{Wave, WaveFlags, WaveKind};

/// Driver side of an instance, shared with the master so closing it can
/// reach every substate.
struct Backend {
    instance: InstanceId,
    driver: Option<Box<dyn AudioDriver>>,
    /// The instance closes the driver when it closes.
    managed: bool,
    closed: bool,
    substates: Vec<Weak<Mutex<Backend>>>,
}

impl Backend {
    /// Stop the engine, close substates and drop voice handles. A borrowed
    /// driver stays here, still open, for `State::close` to hand back.
    fn shutdown(&mut self, table: &SharedTable) {
        if self.closed {
            return;
        }
        self.closed = true;
        for sub in self.substates.drain(..) {
            if let Some(sub) = sub.upgrade() {
                sub.lock().shutdown(table);
            }
        }
        if let Some(driver) = self.driver.as_mut() {
            if let Some(mut engine) = driver.stop() {
                engine.finish();
            }
            if self.managed {
                driver.close();
                self.driver = None;
            }
        }
        let purged = table.lock().purge_voices(self.instance);
        debug!("instance {:?} closed, {purged} voice handles dropped", self.instance);
    }
}

/// An engine instance.
pub struct State {
    id: InstanceId,
    /// Master instance id; objects created through any member are tagged
    /// with it.
    family: InstanceId,
    is_master: bool,
    table: SharedTable,
    link: ControlLink,
    timeline: Timeline,
    root_voice: Handle,
    backend: Arc<Mutex<Backend>>,
    group: Arc<dyn Program>,
    compiler: Option<Arc<dyn crate::compiler::ScriptCompiler>>,
    sample_rate: u32,
    buffer: usize,
    channels: usize,
    flags: StateFlags,
    render: RenderSettings,
    /// Voice detaches that did not fit in the command queue.
    deferred: Mutex<Vec<Teardown>>,
}

impl State {
    // ═══════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════

    /// Open a master instance with a fresh handle table.
    pub fn open(config: Config) -> Result<State> {
        let table = SharedTable::new();
        let id = table.lock().next_instance_id();
        let state = Self::create(config, table, id, id)?;
        info!(
            "opened instance {:?} ({} Hz, {} frames, {} channels)",
            id, state.sample_rate, state.buffer, state.channels
        );
        Ok(state)
    }

    /// Open a substate sharing this instance's handle table.
    pub fn substate(&self, config: Config) -> Result<State> {
        self.ensure_open()?;
        let id = self.table.lock().next_instance_id();
        let sub = Self::create(config, self.table.clone(), id, self.family)?;
        {
            let mut backend = self.backend.lock();
            // Closed substates leave a dead entry behind.
            backend.substates.retain(|w| w.strong_count() > 0);
            backend.substates.push(Arc::downgrade(&sub.backend));
        }
        debug!("opened substate {:?} under {:?}", id, self.id);
        Ok(sub)
    }

    fn create(
        mut config: Config,
        table: SharedTable,
        id: InstanceId,
        family: InstanceId,
    ) -> Result<State> {
        config.validate()?;
        let requested = DriverSettings {
            sample_rate: config.sample_rate,
            buffer: config.buffer,
            channels: config.channels,
        };
        let (mut driver, managed) = match config.driver.take() {
            Some(driver) if driver.is_open() => {
                let managed = driver.flags().contains(StateFlags::STATE_CLOSE);
                (driver, managed)
            }
            Some(mut driver) => {
                driver.open(requested, config.flags)?;
                (driver, true)
            }
            None => {
                let mut driver: Box<dyn AudioDriver> = Box::new(BufferDriver::new());
                driver.open(requested, config.flags)?;
                (driver, true)
            }
        };
        let settings = driver.settings();
        let mut flags = config.flags;
        flags.set(StateFlags::REALTIME, driver.is_realtime());

        let group: Arc<dyn Program> = Arc::new(GroupProgram);
        let root_voice = {
            let mut table = table.lock();
            let root = table.insert_voice(id, Arc::clone(&group), 0)?;
            table.voice_started(root);
            root
        };

        let (link, engine_link) = create_bridge(config.queue_capacity);
        let setup = EngineSetup {
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            max_voices: config.max_voices,
            queue_capacity: config.queue_capacity,
        };
        let voice_setup = VoiceSetup {
            sample_rate: settings.sample_rate,
            channels: settings.channels,
        };
        let root_unit = group.instantiate(&voice_setup, &Args::EMPTY);
        let engine = Engine::new(engine_link, &setup, root_voice, root_unit);
        if let Err(e) = driver.start(engine) {
            table.lock().purge_voices(id);
            if managed {
                driver.close();
            }
            return Err(e);
        }

        let backend = Backend {
            instance: id,
            driver: Some(driver),
            managed,
            closed: false,
            substates: Vec::new(),
        };
        Ok(State {
            id,
            family,
            is_master: id == family,
            table,
            link,
            timeline: Timeline::new(settings.sample_rate),
            root_voice,
            backend: Arc::new(Mutex::new(backend)),
            group,
            compiler: config.compiler,
            sample_rate: settings.sample_rate,
            buffer: settings.buffer,
            channels: settings.channels,
            flags,
            render: RenderSettings::default(),
            deferred: Mutex::new(Vec::new()),
        })
    }

    /// Close the instance and every substate still open under it.
    ///
    /// Returns the driver if it was handed over already open and the
    /// instance was not asked to close it.
    pub fn close(mut self) -> Option<Box<dyn AudioDriver>> {
        self.shutdown();
        let driver = self.backend.lock().driver.take();
        driver
    }

    fn shutdown(&mut self) {
        let mut backend = self.backend.lock();
        if backend.closed {
            return;
        }
        if self.link.send(Command::new(0, Action::KillAll)).is_err() {
            debug!("command queue full, instance {:?} killed on stop", self.id);
        }
        backend.shutdown(&self.table);
        drop(backend);
        if self.is_master {
            let mut teardowns = Vec::new();
            let released = self.table.lock().unload_all(self.family, &mut teardowns);
            info!("closed instance {:?}, released {released} objects", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.backend.lock().closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// The root voice of this instance's voice tree.
    pub fn root_voice(&self) -> Handle {
        self.root_voice
    }

    /// The shared handle table.
    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn flags(&self) -> StateFlags {
        self.flags
    }

    /// Latest counters published by the engine.
    pub fn readback(&self) -> EngineReadback {
        self.link.readback()
    }

    pub fn render_settings(&self) -> &RenderSettings {
        &self.render
    }

    pub fn render_settings_mut(&mut self) -> &mut RenderSettings {
        &mut self.render
    }

    /// Apply engine notices to the table and retry deferred detaches.
    pub fn poll(&self) {
        let notices: Vec<Notice> = self.link.drain_notices().collect();
        if !notices.is_empty() {
            let mut teardowns = Vec::new();
            {
                let mut table = self.table.lock();
                for notice in notices {
                    match notice {
                        Notice::Started(h) => table.voice_started(h),
                        Notice::Ended(h) => table.voice_ended(h, &mut teardowns),
                        Notice::Detached(h) => table.voice_detached(h, &mut teardowns),
                    }
                }
            }
            self.route_teardowns(teardowns);
        }

        let retry: Vec<Teardown> = std::mem::take(&mut *self.deferred.lock());
        for td in retry {
            self.detach(td);
        }
    }

    fn route_teardowns(&self, teardowns: Vec<Teardown>) {
        for td in teardowns {
            if td.instance == self.id {
                self.detach(td);
            } else {
                warn!("voice {} belongs to another instance, not detached", td.handle);
            }
        }
    }

    /// Queue a detach, never due before the voice's own start.
    fn detach(&self, td: Teardown) {
        let due = self.stamp().max(td.not_before);
        let cmd = Command::new(due, Action::Detach { target: td.handle });
        if self.link.send(cmd).is_err() {
            self.deferred.lock().push(td);
        }
    }

    /// Run the engine for `frames` frames and copy the planar output into
    /// `out`. Offline drivers only.
    pub fn run(&self, frames: usize, out: &mut Vec<f32>) -> Result<()> {
        self.ensure_open()?;
        {
            let mut backend = self.backend.lock();
            let driver = backend.driver.as_mut().ok_or(Error::Closed)?;
            let rendered = driver.run(frames)?;
            out.clear();
            out.extend_from_slice(rendered);
        }
        self.poll();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Objects
    // ═══════════════════════════════════════════════════════════════

    pub fn type_of(&self, handle: Handle) -> Result<ObjectKind> {
        self.table.lock().type_of(handle)
    }

    pub fn type_name(kind: ObjectKind) -> &'static str {
        kind.name()
    }

    /// Human readable description of an object.
    pub fn describe(&self, handle: Handle) -> Result<String> {
        self.table.lock().describe(handle)
    }

    pub fn name(&self, handle: Handle) -> Result<Option<String>> {
        Ok(self.table.lock().name(handle)?.map(str::to_string))
    }

    pub fn retain(&self, handle: Handle) -> Result<()> {
        self.poll();
        self.table.lock().retain(handle)
    }

    /// Drop one reference. Voices still held by the engine report
    /// [`Released::Deferred`]; their slot is recycled once the engine lets
    /// go of them.
    pub fn release(&self, handle: Handle) -> Result<Released> {
        self.poll();
        if handle == self.root_voice {
            return Err(Error::Refused);
        }
        let mut teardowns = Vec::new();
        let released = {
            let mut table = self.table.lock();
            if let Some(voice) = table.get(handle)?.voice() {
                if voice.instance != self.id {
                    return Err(Error::ForeignVoice);
                }
            }
            table.release(handle, &mut teardowns)?
        };
        if released.is_refused() {
            debug!("release of voice {handle} deferred");
        }
        self.route_teardowns(teardowns);
        Ok(released)
    }

    pub fn assign(&self, owner: Handle, handle: Handle) -> Result<()> {
        self.table.lock().assign(owner, handle)
    }

    pub fn export(&self, owner: Handle, handle: Handle, name: Option<&str>) -> Result<()> {
        self.table.lock().export(owner, handle, name)
    }

    fn insert_api_object(&self, record: Record) -> Result<Handle> {
        let mut record = record;
        record.api_owner = Some(self.family);
        self.table.lock().insert(record)
    }

    /// Create an empty bank.
    pub fn new_bank(&self, name: Option<&str>) -> Result<Handle> {
        self.ensure_open()?;
        self.insert_api_object(Record::new(Payload::Bank).with_name(name))
    }

    pub fn new_string(&self, text: &str) -> Result<Handle> {
        self.ensure_open()?;
        self.insert_api_object(Record::new(Payload::String(text.to_string())))
    }

    /// Register a program object. It is named after the program.
    pub fn new_program(&self, program: Arc<dyn Program>) -> Result<Handle> {
        self.ensure_open()?;
        let name = program.name().map(str::to_string);
        self.insert_api_object(Record::new(Payload::Program(program)).with_name(name.as_deref()))
    }

    /// Create an empty wave. A `period` of 0 tunes it to this instance's
    /// sample rate.
    pub fn new_wave(&self, kind: WaveKind, period: u32, flags: WaveFlags) -> Result<Handle> {
        self.ensure_open()?;
        let period = match period {
            0 => Wave::period_for_rate(self.sample_rate),
            p => p,
        };
        self.insert_api_object(Record::new(Payload::Wave(Wave::new(kind, period, flags))))
    }

    /// Append sample frames to a writable object.
    pub fn write(&self, handle: Handle, frames: &[f32]) -> Result<()> {
        match &mut self.table.lock().get_mut(handle)?.payload {
            Payload::Wave(wave) => {
                wave.write(frames);
                Ok(())
            }
            _ => Err(Error::WrongType),
        }
    }

    /// Prepare a written object for use.
    pub fn flush(&self, handle: Handle) -> Result<()> {
        match &mut self.table.lock().get_mut(handle)?.payload {
            Payload::Wave(wave) => {
                wave.flush();
                Ok(())
            }
            _ => Err(Error::WrongType),
        }
    }

    /// Compile a script file into a new bank named after the file.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Handle> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("bank");
        self.load_string(&source, name)
    }

    /// Compile script source into a new bank called `name`.
    pub fn load_string(&self, source: &str, name: &str) -> Result<Handle> {
        self.ensure_open()?;
        let compiler = self
            .compiler
            .as_ref()
            .ok_or(Error::NotSupported("no script compiler configured"))?;
        let def = compiler.compile(source, name).map_err(Error::Script)?;
        let count = def.len();
        let export_all = self.flags.contains(StateFlags::EXPORT_ALL);
        let mut table = self.table.lock();
        let bank = build_bank(&mut table, def, name, export_all)?;
        table.get_mut(bank)?.api_owner = Some(self.family);
        debug!("loaded '{name}': {count} definitions, bank {bank}");
        Ok(bank)
    }

    /// Release every object this instance family created and still holds.
    pub fn unload_all(&self) -> usize {
        let mut teardowns = Vec::new();
        let released = self.table.lock().unload_all(self.family, &mut teardowns);
        self.route_teardowns(teardowns);
        debug!("unloaded {released} objects");
        released
    }

    /// Resolve a `/` separated export path.
    pub fn get(&self, node: Handle, path: &str) -> Result<Handle> {
        self.table.lock().lookup(node, path)
    }

    pub fn get_export(&self, node: Handle, index: usize) -> Result<Handle> {
        self.table.lock().export_at(node, index)
    }

    pub fn get_export_name(&self, node: Handle, index: usize) -> Result<String> {
        Ok(self.table.lock().export_name_at(node, index)?.to_string())
    }

    // ═══════════════════════════════════════════════════════════════
    // Timing
    // ═══════════════════════════════════════════════════════════════

    /// Stamp subsequent commands with the current engine time.
    pub fn now(&mut self) {
        let latency = if self.flags.contains(StateFlags::REALTIME) {
            self.buffer as u64
        } else {
            0
        };
        self.timeline.now(self.link.sample_position(), latency);
    }

    /// Delay subsequent commands by `ms` milliseconds.
    pub fn wait(&mut self, ms: f32) {
        self.timeline.wait(ms);
    }

    /// Timestamp for the next command.
    fn stamp(&self) -> Ticks {
        if self.flags.contains(StateFlags::TIMESTAMP) {
            self.timeline.cursor()
        } else {
            0
        }
    }

    fn submit(&self, action: Action) -> Result<()> {
        self.link.send(Command::new(self.stamp(), action))
    }

    // ═══════════════════════════════════════════════════════════════
    // Voices
    // ═══════════════════════════════════════════════════════════════

    /// Program of a voice owned by this instance.
    fn own_voice(&self, table: &HandleTable, handle: Handle) -> Result<Arc<dyn Program>> {
        let voice = table.get(handle)?.voice().ok_or(Error::WrongType)?;
        if voice.instance != self.id {
            return Err(Error::ForeignVoice);
        }
        Ok(Arc::clone(&voice.program))
    }

    fn voice_setup(&self) -> VoiceSetup {
        VoiceSetup {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    fn launch(
        &self,
        parent: Handle,
        program: Arc<dyn Program>,
        args: &Args,
        bind: bool,
    ) -> Result<Option<Handle>> {
        self.ensure_open()?;
        self.poll();
        check_args(program.as_ref(), 0, args)?;
        let due = self.stamp();
        let handle = {
            let mut table = self.table.lock();
            self.own_voice(&table, parent)?;
            if bind {
                Some(table.insert_voice(self.id, Arc::clone(&program), due)?)
            } else {
                None
            }
        };
        let unit = program.instantiate(&self.voice_setup(), args);
        let sent = self.link.send(Command::new(
            due,
            Action::Start {
                parent,
                handle,
                unit,
            },
        ));
        if let Err(e) = sent {
            if let Some(h) = handle {
                // Never reached the engine; drop the placeholder.
                self.table.lock().voice_ended(h, &mut Vec::new());
            }
            return Err(e);
        }
        Ok(handle)
    }

    fn program_of(&self, program: Handle) -> Result<Arc<dyn Program>> {
        match &self.table.lock().get(program)?.payload {
            Payload::Program(p) => Ok(Arc::clone(p)),
            _ => Err(Error::WrongType),
        }
    }

    /// Start `program` on a new subvoice of `parent` and return its handle.
    ///
    /// The handle is usable right away; the voice makes sound once the
    /// engine reaches the current timestamp.
    pub fn start(&self, parent: Handle, program: Handle, args: &Args) -> Result<Handle> {
        let program = self.program_of(program)?;
        self.launch(parent, program, args, true)?
            .ok_or(Error::InvalidHandle)
    }

    /// Start `program` on a new subvoice that gets no handle.
    pub fn play(&self, parent: Handle, program: Handle, args: &Args) -> Result<()> {
        let program = self.program_of(program)?;
        self.launch(parent, program, args, false).map(|_| ())
    }

    /// Start a group voice (volume and pan control) under `parent`.
    pub fn new_group(&self, parent: Handle) -> Result<Handle> {
        self.launch(parent, Arc::clone(&self.group), &Args::EMPTY, true)?
            .ok_or(Error::InvalidHandle)
    }

    /// Send a message to entry point `entry` of a voice.
    pub fn send(&self, voice: Handle, entry: usize, args: &Args) -> Result<()> {
        self.ensure_open()?;
        self.poll();
        let program = self.own_voice(&self.table.lock(), voice)?;
        if entry == 0 {
            return Err(Error::IndexRange);
        }
        check_args(program.as_ref(), entry, args)?;
        self.submit(Action::Send {
            target: voice,
            entry,
            args: *args,
        })
    }

    /// Send a message to every child of a voice.
    pub fn send_children(&self, voice: Handle, entry: usize, args: &Args) -> Result<()> {
        self.ensure_open()?;
        self.poll();
        self.own_voice(&self.table.lock(), voice)?;
        if entry == 0 || entry >= MAX_ENTRY_POINTS {
            return Err(Error::IndexRange);
        }
        self.submit(Action::SendChildren {
            target: voice,
            entry,
            args: *args,
        })
    }

    /// Terminate a voice and everything below it.
    pub fn kill(&self, voice: Handle) -> Result<()> {
        self.ensure_open()?;
        self.poll();
        self.own_voice(&self.table.lock(), voice)?;
        if voice == self.root_voice {
            return Err(Error::Refused);
        }
        self.submit(Action::Kill { target: voice })
    }

    /// Terminate every child of a voice.
    pub fn kill_children(&self, voice: Handle) -> Result<()> {
        self.ensure_open()?;
        self.poll();
        self.own_voice(&self.table.lock(), voice)?;
        self.submit(Action::KillChildren { target: voice })
    }

    /// Run `callback` on the voice's output after each fragment.
    pub fn tap(&self, voice: Handle, callback: TapFn) -> Result<()> {
        self.set_xinsert(voice, XInsert::Tap(callback))
    }

    /// Run `callback` on the voice's output in place after each fragment.
    pub fn insert(&self, voice: Handle, callback: InsertFn) -> Result<()> {
        self.set_xinsert(voice, XInsert::Insert(callback))
    }

    fn set_xinsert(&self, voice: Handle, xinsert: XInsert) -> Result<()> {
        self.ensure_open()?;
        self.own_voice(&self.table.lock(), voice)?;
        self.submit(Action::SetXInsert {
            target: voice,
            xinsert,
        })
    }

    // ═══════════════════════════════════════════════════════════════
    // Properties
    // ═══════════════════════════════════════════════════════════════

    /// Read a property. Object properties need a handle; instance
    /// properties ignore it.
    pub fn get_property(&self, handle: Option<Handle>, property: Property) -> Result<i32> {
        if property.is_object() {
            let handle = handle.ok_or(Error::InvalidHandle)?;
            let table = self.table.lock();
            let record = table.get(handle)?;
            return match property {
                Property::Flags => Ok(record.flags),
                Property::RefCount => Ok(clamp_i32(record.refcount as u64)),
                Property::Looped => match &record.payload {
                    Payload::Wave(wave) => Ok(wave.is_looped() as i32),
                    _ => Err(Error::WrongType),
                },
                _ => Err(Error::NotSupported("object property")),
            };
        }

        let rb = self.link.readback();
        Ok(match property {
            Property::SampleRate => clamp_i32(self.sample_rate as u64),
            Property::Buffer => clamp_i32(self.buffer as u64),
            Property::Channels => self.channels as i32,
            Property::StateFlags => self.flags.0 as i32,
            Property::ActiveVoices => rb.active_voices as i32,
            Property::FreeVoices => rb.free_voices as i32,
            Property::TotalVoices => rb.total_voices as i32,
            Property::CpuLoadAvg => clamp_i32(rb.cpu_load_avg as u64),
            Property::CpuLoadMax => clamp_i32(rb.cpu_load_max as u64),
            Property::CpuTimeAvg => clamp_i32(rb.cpu_time_avg as u64),
            Property::CpuTimeMax => clamp_i32(rb.cpu_time_max as u64),
            Property::Instructions => clamp_i32(rb.instructions),
            Property::ExportAll => self.flags.contains(StateFlags::EXPORT_ALL) as i32,
            Property::OfflineBuffer => clamp_i32(self.render.offline_buffer as u64),
            Property::SilenceLevel => self.render.silence_level_fixed().raw(),
            Property::SilenceWindow => clamp_i32(self.render.silence_window),
            Property::SilenceGrace => clamp_i32(self.render.silence_grace),
            Property::Flags | Property::RefCount | Property::Looped => {
                return Err(Error::NotSupported("object property"));
            }
        })
    }

    /// Write a property.
    pub fn set_property(
        &mut self,
        handle: Option<Handle>,
        property: Property,
        value: i32,
    ) -> Result<()> {
        if !property.is_writable() {
            return Err(Error::ReadOnly(property));
        }
        if property.is_object() {
            let handle = handle.ok_or(Error::InvalidHandle)?;
            let mut table = self.table.lock();
            let record = table.get_mut(handle)?;
            return match (property, &mut record.payload) {
                (Property::Flags, _) => {
                    record.flags = value;
                    Ok(())
                }
                (Property::Looped, Payload::Wave(wave)) => {
                    wave.set_looped(value != 0);
                    Ok(())
                }
                _ => Err(Error::WrongType),
            };
        }

        let non_negative = |v: i32| u64::try_from(v).map_err(|_| Error::IndexRange);
        match property {
            Property::StateFlags => {
                // REALTIME follows the driver.
                let realtime = self.flags.contains(StateFlags::REALTIME);
                self.flags = StateFlags(value as u32);
                self.flags.set(StateFlags::REALTIME, realtime);
            }
            Property::ExportAll => self.flags.set(StateFlags::EXPORT_ALL, value != 0),
            Property::OfflineBuffer => {
                if !(1..=MAX_BUFFER as i32).contains(&value) {
                    return Err(Error::IndexRange);
                }
                self.render.offline_buffer = value as usize;
            }
            Property::SilenceLevel => {
                non_negative(value)?;
                self.render.silence_level = Fixed(value).to_f32();
            }
            Property::SilenceWindow => self.render.silence_window = non_negative(value)?,
            Property::SilenceGrace => self.render.silence_grace = non_negative(value)?,
            _ => return Err(Error::ReadOnly(property)),
        }
        Ok(())
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[inline]
fn clamp_i32(v: u64) -> i32 {
    v.min(i32::MAX as u64) as i32
}

fn check_args(program: &dyn Program, entry: usize, args: &Args) -> Result<()> {
    if entry >= program.entry_points() {
        return Err(Error::IndexRange);
    }
    let expected = program.max_args(entry);
    if args.len() > expected {
        return Err(Error::ArgCount {
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

/// Create a bank from a compiled description. On failure nothing created
/// here survives.
fn build_bank(
    table: &mut HandleTable,
    def: BankDef,
    name: &str,
    export_all: bool,
) -> Result<Handle> {
    let bank = table.insert(Record::new(Payload::Bank).with_name(Some(name)))?;
    if let Err(e) = fill_bank(table, bank, def, export_all) {
        let _ = table.release(bank, &mut Vec::new());
        return Err(e);
    }
    Ok(bank)
}

fn fill_bank(table: &mut HandleTable, bank: Handle, def: BankDef, export_all: bool) -> Result<()> {
    let entries = def
        .exports
        .into_iter()
        .map(|entry| (entry, true))
        .chain(def.locals.into_iter().map(|entry| (entry, export_all)));
    for ((name, def), public) in entries {
        let handle = match def {
            Definition::Bank(sub) => build_bank(table, sub, &name, export_all)?,
            Definition::Program(p) => {
                table.insert(Record::new(Payload::Program(p)).with_name(Some(&name)))?
            }
            Definition::String(s) => {
                table.insert(Record::new(Payload::String(s)).with_name(Some(&name)))?
            }
            Definition::Wave(w) => {
                table.insert(Record::new(Payload::Wave(w)).with_name(Some(&name)))?
            }
        };
        let filed = if public {
            table.export(bank, handle, Some(&name))
        } else {
            table.assign(bank, handle)
        };
        if let Err(e) = filed {
            let _ = table.release(handle, &mut Vec::new());
            return Err(e);
        }
    }
    Ok(())
}
