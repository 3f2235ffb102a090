// This module is the front end's view of the allocator. A Compiler records one compilation
// unit as a list of events: every operation the front end requests (arithmetic, moves, calls,
// branches, logical instruction boundaries) appends an event, links it to its predecessor and
// declares the reads it will perform, each constrained by what the target's operand plans
// accept. Operations the target plans as thunks become calls to runtime helpers supplied by
// the Client. The abstract frame (operand stack and locals) is tracked as persistent arena
// data so save_state/restore_state are cheap. Nothing is placed or emitted while building;
// compile() walks the events afterwards and write() produces final bytes once the caller has
// chosen a base address.
//
// Front end contract: a jump does not end the current path; the next start_logical_ip or
// visit_logical_ip call is taken to be the jump target. Before visiting an earlier logical
// instruction the path must end in a jump (or be a conditional branch to it). Values that must
// survive into a junction have to occupy a frame slot (local or operand stack entry).

//! Front end API: building events for one compilation unit.

use hashbrown::HashMap;

use crate::arch::{
    Architecture, BinaryOp, BranchOp, Client, Constant, NullaryOp, Register, TernaryOp,
    ThunkOp, CONSTANT_MASK, MEMORY_MASK, REGISTER_MASK,
};

use super::config::AllocatorConfig;
use super::error::{CompileError, CompileResult};
use super::event::{CallArgument, Event, EventGraph, EventId, EventKind};
use super::frame::{ForkState, FrameLayout, FrameState};
use super::promise::{CodeLayout, PromiseId, PromiseTable};
use super::session::{CompilationSession, SessionStats};
use super::site::{FrameConstraint, Site, SiteMask};
use super::value::{FrameHome, ReadKind, ValueId, ValueTable, ValueType};

/// Builder and driver for one compilation unit.
pub struct Compiler<'a> {
    pub(crate) session: &'a CompilationSession<'a>,
    pub(crate) arch: &'a dyn Architecture,
    client: &'a dyn Client,
    pub(crate) config: AllocatorConfig,
    pub(crate) values: ValueTable,
    pub(crate) events: EventGraph<'a>,
    pub(crate) promises: PromiseTable,
    frame: FrameState<'a>,
    /// Event the next appended event follows, if control can reach it.
    predecessor: Option<EventId>,
    current_ip: Option<u32>,
    logical_code: HashMap<u32, EventId>,
    ip_promises: HashMap<u32, PromiseId>,
    logical_code_length: u32,
    initialized: bool,
    register_parameters: u32,
    stack_parameters: u32,
    local_footprint: u32,
    max_stack_depth: u32,
    outgoing_footprint: u32,
    pub(crate) code_layout: Option<CodeLayout>,
}

/// Branch on the sign returned by a comparison helper.
fn sign_test(op: BranchOp) -> BranchOp {
    match op {
        BranchOp::JumpIfEqual | BranchOp::JumpIfFloatEqual => BranchOp::JumpIfEqual,
        BranchOp::JumpIfNotEqual | BranchOp::JumpIfFloatNotEqual => BranchOp::JumpIfNotEqual,
        BranchOp::JumpIfLess | BranchOp::JumpIfUnsignedLess | BranchOp::JumpIfFloatLess => {
            BranchOp::JumpIfLess
        }
        BranchOp::JumpIfGreater
        | BranchOp::JumpIfUnsignedGreater
        | BranchOp::JumpIfFloatGreater => BranchOp::JumpIfGreater,
        BranchOp::JumpIfLessOrEqual | BranchOp::JumpIfUnsignedLessOrEqual => {
            BranchOp::JumpIfLessOrEqual
        }
        BranchOp::JumpIfGreaterOrEqual | BranchOp::JumpIfUnsignedGreaterOrEqual => {
            BranchOp::JumpIfGreaterOrEqual
        }
    }
}

impl<'a> Compiler<'a> {
    pub fn new(
        session: &'a CompilationSession<'a>,
        arch: &'a dyn Architecture,
        client: &'a dyn Client,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            session,
            arch,
            client,
            config,
            values: ValueTable::new(),
            events: EventGraph::new(),
            promises: PromiseTable::new(),
            frame: FrameState::new(session.arena(), 0),
            predecessor: None,
            current_ip: None,
            logical_code: HashMap::new(),
            ip_promises: HashMap::new(),
            logical_code_length: 0,
            initialized: false,
            register_parameters: 0,
            stack_parameters: 0,
            local_footprint: 0,
            max_stack_depth: 0,
            outgoing_footprint: 0,
            code_layout: None,
        }
    }

    /// Size the unit: `parameter_footprint` and `local_footprint` are in
    /// words, locals including parameters.
    pub fn init(
        &mut self,
        logical_code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
    ) -> CompileResult<()> {
        if self.initialized {
            return Err(CompileError::invalid("unit initialised twice"));
        }
        let registers = self.arch.argument_registers().len() as u32;
        self.register_parameters = parameter_footprint.min(registers);
        self.stack_parameters = parameter_footprint - self.register_parameters;
        self.local_footprint = local_footprint.max(parameter_footprint);
        self.logical_code_length = logical_code_length;
        self.frame = FrameState::new(self.session.arena(), self.local_footprint as usize);
        self.initialized = true;
        log::debug!(
            "init: {logical_code_length} logical instructions, {parameter_footprint} parameter words, {} local words",
            self.local_footprint
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> CompileResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(CompileError::invalid("unit used before init"))
        }
    }

    fn word(&self) -> u32 {
        self.arch.word_size()
    }

    pub fn values(&self) -> &ValueTable {
        &self.values
    }

    pub fn events(&self) -> &EventGraph<'a> {
        &self.events
    }

    pub fn promises(&self) -> &PromiseTable {
        &self.promises
    }

    /// Final placement of blocks, known after `compile`.
    pub fn code_layout(&self) -> Option<&CodeLayout> {
        self.code_layout.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Concrete frame implied by everything built so far.
    pub fn frame_layout(&self) -> FrameLayout {
        FrameLayout::new(
            self.arch.stack_register(),
            self.word(),
            self.arch.frame_header_size(),
            self.arch.stack_alignment_in_words(),
            self.register_parameters,
            self.stack_parameters,
            self.local_footprint,
            self.max_stack_depth,
            self.outgoing_footprint,
        )
    }

    /// A fresh value, split into low and high words if wider than a word.
    fn new_value(&mut self, ty: ValueType, size: u32) -> ValueId {
        let word = self.word();
        if size <= word {
            return self.values.create(ty, size);
        }
        let low = self.values.create(ty, word);
        let high = self.values.create(ty, word);
        self.values.get_mut(low).high = Some(high);
        low
    }

    /// Word-sized parts of a `size`-byte value, low first.
    fn parts(&self, value: ValueId, size: u32) -> CompileResult<Vec<ValueId>> {
        if size <= self.word() {
            return Ok(vec![value]);
        }
        let high = self
            .values
            .get(value)
            .high
            .ok_or_else(|| CompileError::invalid(format!("{value} has no high word")))?;
        Ok(vec![value, high])
    }

    fn append(&mut self, kind: EventKind) -> EventId {
        let mut event = Event::new(kind, self.frame);
        event.logical_ip = self.current_ip;
        let id = self.events.append(event);
        if let Some(predecessor) = self.predecessor {
            self.events.add_link(predecessor, id, self.frame, Vec::new());
        }
        self.predecessor = Some(id);
        id
    }

    fn read(&mut self, event: EventId, value: ValueId, mask: SiteMask) {
        let read = self
            .values
            .append_read(value, ReadKind::Single { mask }, Some(event));
        self.events.get_mut(event).reads.push(read);
    }

    /// Link `predecessor` to the start of a logical instruction, keeping
    /// every slot value alive until the edge is resolved.
    fn link_with_stubs(&mut self, predecessor: EventId, successor: EventId) {
        let mut stubs = Vec::new();
        for (home, value) in self.frame.slots() {
            let stub =
                self.values
                    .append_read(value, ReadKind::Stub { target: None }, Some(predecessor));
            stubs.push((home, stub));
        }
        self.events
            .add_link(predecessor, successor, self.frame, stubs);
    }

    /// Code position of logical instruction `ip`.
    pub fn machine_ip(&mut self, ip: u32) -> PromiseId {
        if let Some(promise) = self.ip_promises.get(&ip) {
            return *promise;
        }
        let promise = self.promises.code();
        self.ip_promises.insert(ip, promise);
        promise
    }

    pub fn start_logical_ip(&mut self, ip: u32) -> CompileResult<()> {
        self.ensure_initialized()?;
        if ip >= self.logical_code_length {
            return Err(CompileError::invalid(format!(
                "logical instruction {ip} out of range"
            )));
        }
        if self.logical_code.contains_key(&ip) {
            return Err(CompileError::invalid(format!(
                "logical instruction {ip} started twice"
            )));
        }
        let promise = self.machine_ip(ip);
        let mut event = Event::new(EventKind::Dummy, self.frame);
        event.promise = Some(promise);
        event.logical_ip = Some(ip);
        let id = self.events.append(event);
        if let Some(predecessor) = self.predecessor {
            self.link_with_stubs(predecessor, id);
        }
        self.predecessor = Some(id);
        self.current_ip = Some(ip);
        self.logical_code.insert(ip, id);
        Ok(())
    }

    /// Continue into the already built logical instruction `ip`; the
    /// current path ends here.
    pub fn visit_logical_ip(&mut self, ip: u32) -> CompileResult<()> {
        let target = *self.logical_code.get(&ip).ok_or_else(|| {
            CompileError::invalid(format!("logical instruction {ip} visited before it was started"))
        })?;
        if let Some(predecessor) = self.predecessor {
            self.link_with_stubs(predecessor, target);
        }
        self.predecessor = None;
        Ok(())
    }

    /// Remember the current path so another one can be built from here.
    pub fn save_state(&mut self) -> ForkState<'a> {
        let mut multi_reads = Vec::new();
        if let Some(predecessor) = self.predecessor {
            for (_, value) in self.frame.slots() {
                if multi_reads.iter().any(|(v, _)| *v == value) {
                    continue;
                }
                let read = match self.values.get(value).pending_multi {
                    Some(read) => read,
                    None => {
                        let read = self.values.append_read(
                            value,
                            ReadKind::Multi {
                                alternatives: Vec::new(),
                            },
                            Some(predecessor),
                        );
                        self.values.get_mut(value).pending_multi = Some(read);
                        self.events.get_mut(predecessor).fork_reads.push(read);
                        read
                    }
                };
                multi_reads.push((value, read));
            }
        }
        ForkState {
            frame: self.frame,
            predecessor: self.predecessor,
            multi_reads,
        }
    }

    pub fn restore_state(&mut self, state: &ForkState<'a>) {
        self.frame = state.frame;
        self.predecessor = state.predecessor;
        for (value, read) in &state.multi_reads {
            self.values.get_mut(*value).pending_multi = Some(*read);
        }
    }

    pub fn constant(&mut self, size: u32, value: i64) -> ValueId {
        let word = self.word();
        if size > word {
            let low = self.constant(word, value & 0xffff_ffff);
            let high = self.constant(word, value >> 32);
            self.values.get_mut(low).high = Some(high);
            return low;
        }
        let id = self.values.create(ValueType::Integer, size);
        self.values
            .get_mut(id)
            .sites
            .push(Site::Constant(Constant::Value(value)));
        id
    }

    /// Constant whose value is known only once `promise` resolves.
    pub fn promise_constant(&mut self, size: u32, promise: PromiseId) -> ValueId {
        let word = self.word();
        if size > word {
            let low_promise = self.promises.shift_mask(promise, 0, 0xffff_ffff);
            let high_promise = self.promises.shift_mask(promise, 32, 0xffff_ffff);
            let low = self.promise_constant(word, low_promise);
            let high = self.promise_constant(word, high_promise);
            self.values.get_mut(low).high = Some(high);
            return low;
        }
        let id = self.values.create(ValueType::Integer, size);
        self.values
            .get_mut(id)
            .sites
            .push(Site::Constant(Constant::Promise(promise)));
        id
    }

    pub fn address(&mut self, promise: PromiseId) -> ValueId {
        let id = self.values.create(ValueType::Integer, self.word());
        self.values
            .get_mut(id)
            .sites
            .push(Site::Address(Constant::Promise(promise)));
        id
    }

    /// Value living in a fixed register from this point on.
    pub fn register(&mut self, register: Register) -> CompileResult<ValueId> {
        self.ensure_initialized()?;
        if u32::from(register) >= self.arch.register_count() {
            return Err(CompileError::invalid(format!("no register r{register}")));
        }
        let value = self.values.create(ValueType::Integer, self.word());
        self.append(EventKind::RegisterSite { value, register });
        Ok(value)
    }

    /// Memory operand `[base + index * scale + displacement]`.
    pub fn memory(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
    ) -> CompileResult<ValueId> {
        self.ensure_initialized()?;
        let result = self.values.create(ValueType::Integer, self.word());
        let id = self.append(EventKind::Memory {
            base,
            displacement,
            index,
            scale,
            result,
        });
        let general = SiteMask::register(self.arch.general_registers());
        self.read(id, base, general);
        if let Some(index) = index {
            self.read(id, index, general);
        }
        Ok(result)
    }

    /// Value to keep in frame slot `home`: `value` itself, or a fresh alias
    /// when `value` already belongs to another slot.
    fn slot_value(&mut self, value: ValueId, home: FrameHome) -> CompileResult<ValueId> {
        let (size, ty, current) = {
            let v = self.values.get(value);
            (v.size, v.ty, v.home)
        };
        match current {
            None => {
                self.values.get_mut(value).home = Some(home);
                Ok(value)
            }
            Some(existing) if existing == home => Ok(value),
            Some(_) => {
                let alias = self.move_event(BinaryOp::Move, size, value, size)?;
                let entry = self.values.get_mut(alias);
                entry.ty = ty;
                entry.home = Some(home);
                Ok(alias)
            }
        }
    }

    fn push_word(&mut self, value: ValueId) -> CompileResult<ValueId> {
        let depth = self.frame.depth();
        let value = self.slot_value(value, FrameHome::Stack(depth))?;
        self.frame = self.frame.push(self.session.arena(), value);
        self.max_stack_depth = self.max_stack_depth.max(depth + 1);
        Ok(value)
    }

    fn pop_word(&mut self) -> CompileResult<ValueId> {
        let (value, rest) = self
            .frame
            .pop()
            .ok_or_else(|| CompileError::invalid("pop from an empty operand stack"))?;
        self.frame = rest;
        Ok(value)
    }

    /// Push `value`; two-word values take two entries, low on top.
    pub fn push(&mut self, size: u32, value: ValueId) -> CompileResult<()> {
        self.ensure_initialized()?;
        let parts = self.parts(value, size)?;
        let mut placed = Vec::with_capacity(parts.len());
        for part in parts.into_iter().rev() {
            placed.push(self.push_word(part)?);
        }
        if let [high, low] = placed[..] {
            self.values.get_mut(low).high = Some(high);
        }
        Ok(())
    }

    pub fn pop(&mut self, size: u32) -> CompileResult<ValueId> {
        let low = self.pop_word()?;
        if size > self.word() {
            let high = self.pop_word()?;
            self.values.get_mut(low).high = Some(high);
        }
        Ok(low)
    }

    /// Value `index` words below the top of the operand stack.
    pub fn peek(&self, size: u32, index: u32) -> CompileResult<ValueId> {
        let missing = || CompileError::invalid(format!("operand stack has no entry {index}"));
        let low = self.frame.peek(index).ok_or_else(missing)?;
        if size > self.word() {
            let high = self.frame.peek(index + 1).ok_or_else(missing)?;
            if self.values.get(low).high != Some(high) {
                return Err(CompileError::invalid(format!(
                    "entries {index} and {} do not form a two-word value",
                    index + 1
                )));
            }
        }
        Ok(low)
    }

    fn check_local(&self, size: u32, index: u32) -> CompileResult<()> {
        let words = if size > self.word() { 2 } else { 1 };
        if index + words > self.local_footprint {
            return Err(CompileError::invalid(format!("local {index} out of range")));
        }
        Ok(())
    }

    pub fn store_local(&mut self, size: u32, value: ValueId, index: u32) -> CompileResult<()> {
        self.ensure_initialized()?;
        self.check_local(size, index)?;
        let parts = self.parts(value, size)?;
        let mut placed = Vec::with_capacity(parts.len());
        for (offset, part) in parts.into_iter().enumerate() {
            let slot = index + offset as u32;
            let part = self.slot_value(part, FrameHome::Local(slot))?;
            self.frame = self
                .frame
                .store_local(self.session.arena(), slot, Some(part));
            placed.push(part);
        }
        if let [low, high] = placed[..] {
            self.values.get_mut(low).high = Some(high);
        }
        Ok(())
    }

    pub fn load_local(&mut self, size: u32, index: u32) -> CompileResult<ValueId> {
        self.check_local(size, index)?;
        let missing = || CompileError::invalid(format!("local {index} read before written"));
        let low = self.frame.local(index).ok_or_else(missing)?;
        if size > self.word() {
            let high = self.frame.local(index + 1).ok_or_else(missing)?;
            self.values.get_mut(low).high = Some(high);
        }
        Ok(low)
    }

    /// Declare parameter `index` on entry: register-passed parameters arrive
    /// in their argument register, the rest in the caller's area.
    pub fn init_local(&mut self, size: u32, index: u32, ty: ValueType) -> CompileResult<ValueId> {
        self.ensure_initialized()?;
        self.check_local(size, index)?;
        let word = self.word();
        if size > word {
            let low = self.init_word(word, index, ty);
            let high = self.init_word(word, index + 1, ty);
            self.values.get_mut(low).high = Some(high);
            return Ok(low);
        }
        Ok(self.init_word(size, index, ty))
    }

    fn init_word(&mut self, size: u32, index: u32, ty: ValueType) -> ValueId {
        let value = self.values.create(ty, size);
        self.values.get_mut(value).home = Some(FrameHome::Local(index));
        let register = (index < self.register_parameters)
            .then(|| self.arch.argument_registers().get(index as usize).copied())
            .flatten();
        match register {
            Some(register) => self.append(EventKind::RegisterSite { value, register }),
            None => self.append(EventKind::FrameSite {
                value,
                home: FrameHome::Local(index),
            }),
        };
        self.frame = self
            .frame
            .store_local(self.session.arena(), index, Some(value));
        value
    }

    /// Call `address` with `arguments`; returns the result value when
    /// `result_size` is non-zero.
    pub fn call(
        &mut self,
        address: ValueId,
        result_size: u32,
        arguments: &[CallArgument],
    ) -> CompileResult<Option<ValueId>> {
        self.ensure_initialized()?;
        let mut parts = Vec::new();
        for argument in arguments {
            parts.extend(self.parts(argument.value, argument.size)?);
        }
        let registers: Vec<Register> = self.arch.argument_registers().to_vec();
        let stack_words = parts.len().saturating_sub(registers.len()) as u32;
        self.outgoing_footprint = self.outgoing_footprint.max(stack_words);

        let result = if result_size > 0 {
            Some(self.new_value(ValueType::Integer, result_size))
        } else {
            None
        };
        let id = self.append(EventKind::Call {
            address,
            arguments: arguments.to_vec(),
            result_size,
            result,
        });
        for (k, part) in parts.into_iter().enumerate() {
            let mask = match registers.get(k) {
                Some(register) => SiteMask::fixed_register(*register),
                None => SiteMask::frame_slot((k - registers.len()) as u32),
            };
            self.read(id, part, mask);
        }
        let target = SiteMask::from_operand_mask(self.arch.plan_call());
        self.read(id, address, target);
        Ok(result)
    }

    fn thunk_call(
        &mut self,
        op: ThunkOp,
        size: u32,
        result_size: u32,
        arguments: &[CallArgument],
    ) -> CompileResult<ValueId> {
        let helper = self.client.thunk(op, size);
        log::debug!("{op:?} on {size} bytes lowered to helper {helper:#x}");
        self.session.record_thunk();
        let address = self.constant(self.word(), helper);
        self.call(address, result_size, arguments)?
            .ok_or_else(|| CompileError::invalid("helper call produced no result"))
    }

    pub fn return_(&mut self, size: u32, value: Option<ValueId>) -> CompileResult<()> {
        self.ensure_initialized()?;
        let parts = match value {
            Some(value) => self.parts(value, size)?,
            None => Vec::new(),
        };
        let id = self.append(EventKind::Return { size, value });
        let mut registers = std::iter::once(Some(self.arch.return_low()))
            .chain(std::iter::once(self.arch.return_high()));
        for part in parts {
            let register = registers.next().flatten().ok_or_else(|| {
                CompileError::invalid(format!("{size}-byte result has no return register"))
            })?;
            self.read(id, part, SiteMask::fixed_register(register));
        }
        self.predecessor = None;
        Ok(())
    }

    /// Read constraint for the source of a `Move`/`MoveZ` event.
    fn move_source_mask(&self, op: BinaryOp, source_size: u32, destination_size: u32) -> SiteMask {
        let word = self.word();
        let shares_low_word = (source_size > word && destination_size >= word)
            || (source_size == word && destination_size > word)
            || (source_size == destination_size && op.is_move());
        if shares_low_word {
            return SiteMask::any();
        }
        let plan = self
            .arch
            .plan_move(op, source_size.min(word), destination_size.min(word));
        SiteMask::from_operand_mask(plan.source)
    }

    fn move_event(
        &mut self,
        op: BinaryOp,
        source_size: u32,
        source: ValueId,
        destination_size: u32,
    ) -> CompileResult<ValueId> {
        self.ensure_initialized()?;
        let word = self.word();
        let result = self
            .values
            .create(ValueType::Integer, destination_size.min(word));
        if destination_size > word {
            let high = if op == BinaryOp::MoveZ && source_size <= word {
                self.constant(word, 0)
            } else {
                self.values.create(ValueType::Integer, word)
            };
            self.values.get_mut(result).high = Some(high);
        }
        let mask = self.move_source_mask(op, source_size, destination_size);
        let parts = if source_size > word && destination_size > word {
            self.parts(source, source_size)?
        } else {
            vec![source]
        };
        let id = self.append(EventKind::Move {
            op,
            source_size,
            source,
            destination_size,
            result,
        });
        for part in parts {
            self.read(id, part, mask);
        }
        Ok(result)
    }

    /// Sign-extending (or truncating) copy.
    pub fn load(
        &mut self,
        source_size: u32,
        source: ValueId,
        destination_size: u32,
    ) -> CompileResult<ValueId> {
        self.move_event(BinaryOp::Move, source_size, source, destination_size)
    }

    /// Zero-extending copy.
    pub fn load_z(
        &mut self,
        source_size: u32,
        source: ValueId,
        destination_size: u32,
    ) -> CompileResult<ValueId> {
        self.move_event(BinaryOp::MoveZ, source_size, source, destination_size)
    }

    /// Store `source` to the memory operand `destination`.
    pub fn store(
        &mut self,
        source_size: u32,
        source: ValueId,
        destination_size: u32,
        destination: ValueId,
    ) -> CompileResult<()> {
        self.ensure_initialized()?;
        let (value, size) = if destination_size > source_size {
            (self.load(source_size, source, destination_size)?, destination_size)
        } else {
            (source, source_size)
        };
        let word = self.word();
        let parts = self.parts(value, size)?;
        let plan = self
            .arch
            .plan_move(BinaryOp::Move, size.min(word), destination_size.min(word));
        let source_mask = SiteMask::new(
            plan.source.kinds & (REGISTER_MASK | CONSTANT_MASK),
            plan.source.registers,
            FrameConstraint::None,
        );
        let id = self.append(EventKind::Store {
            op: BinaryOp::Move,
            source_size: size,
            source: value,
            destination_size,
            destination,
        });
        for part in parts {
            self.read(id, part, source_mask);
        }
        self.read(
            id,
            destination,
            SiteMask::new(MEMORY_MASK, 0, FrameConstraint::Any),
        );
        Ok(())
    }

    /// `b op a`, through a helper call when the target cannot encode it.
    pub fn binary_op(
        &mut self,
        op: TernaryOp,
        size: u32,
        a: ValueId,
        b: ValueId,
    ) -> CompileResult<ValueId> {
        self.ensure_initialized()?;
        let plan = self.arch.plan_binary(op, size, size);
        if plan.thunk {
            let arguments = [
                CallArgument { size, value: b },
                CallArgument { size, value: a },
            ];
            return self.thunk_call(ThunkOp::Binary(op), size, size, &arguments);
        }
        let first = self.parts(a, size)?;
        let second = self.parts(b, size)?;
        let result = self.new_value(ValueType::Integer, size);
        let id = self.append(EventKind::Combine {
            op,
            size,
            first: a,
            second: b,
            result_size: size,
            result,
        });
        for part in first {
            self.read(id, part, SiteMask::from_operand_mask(plan.first));
        }
        for part in second {
            self.read(id, part, SiteMask::from_operand_mask(plan.second));
        }
        Ok(result)
    }

    pub fn unary_op(&mut self, op: BinaryOp, size: u32, a: ValueId) -> CompileResult<ValueId> {
        self.ensure_initialized()?;
        let plan = self.arch.plan_unary(op, size, size);
        if plan.thunk {
            let arguments = [CallArgument { size, value: a }];
            return self.thunk_call(ThunkOp::Unary(op), size, size, &arguments);
        }
        if size > self.word() {
            return Err(CompileError::invalid(format!(
                "{op:?} on {size} bytes must be planned as a helper call"
            )));
        }
        let result = self.values.create(ValueType::Integer, size);
        let id = self.append(EventKind::Translate {
            op,
            size,
            source: a,
            result_size: size,
            result,
        });
        self.read(id, a, SiteMask::from_operand_mask(plan.operand));
        Ok(result)
    }

    /// Jump to `target` if `b op a`.
    pub fn cond_jump(
        &mut self,
        op: BranchOp,
        size: u32,
        a: ValueId,
        b: ValueId,
        target: PromiseId,
    ) -> CompileResult<()> {
        self.ensure_initialized()?;
        let plan = self.arch.plan_branch(op, size);
        if !plan.thunk {
            return self.branch(op, size, a, b, target);
        }
        let word = self.word();
        let arguments = [
            CallArgument { size, value: b },
            CallArgument { size, value: a },
        ];
        let outcome = self.thunk_call(ThunkOp::Branch(op), size, word, &arguments)?;
        let zero = self.constant(word, 0);
        self.branch(sign_test(op), word, zero, outcome, target)
    }

    fn branch(
        &mut self,
        op: BranchOp,
        size: u32,
        a: ValueId,
        b: ValueId,
        target: PromiseId,
    ) -> CompileResult<()> {
        let plan = self.arch.plan_branch(op, size);
        let id = self.append(EventKind::Branch {
            op,
            size,
            first: a,
            second: b,
            target,
        });
        self.read(id, a, SiteMask::from_operand_mask(plan.first));
        self.read(id, b, SiteMask::from_operand_mask(plan.second));
        Ok(())
    }

    pub fn jmp(&mut self, target: PromiseId) -> CompileResult<()> {
        self.ensure_initialized()?;
        self.append(EventKind::Jump { target });
        Ok(())
    }

    /// Call `handler` unless `index` is below the length stored at
    /// `object + length_offset` (unsigned).
    pub fn check_bounds(
        &mut self,
        object: ValueId,
        length_offset: i32,
        index: ValueId,
        handler: i64,
    ) -> CompileResult<()> {
        self.ensure_initialized()?;
        let general = self.arch.general_registers();
        let id = self.append(EventKind::BoundsCheck {
            object,
            length_offset,
            index,
            handler,
        });
        self.read(id, object, SiteMask::register(general));
        self.read(
            id,
            index,
            SiteMask::new(REGISTER_MASK | CONSTANT_MASK, general, FrameConstraint::None),
        );
        Ok(())
    }

    fn operation(&mut self, op: NullaryOp) -> CompileResult<()> {
        self.ensure_initialized()?;
        self.append(EventKind::Operation { op });
        Ok(())
    }

    pub fn load_barrier(&mut self) -> CompileResult<()> {
        self.operation(NullaryOp::LoadBarrier)
    }

    pub fn store_store_barrier(&mut self) -> CompileResult<()> {
        self.operation(NullaryOp::StoreStoreBarrier)
    }

    pub fn store_load_barrier(&mut self) -> CompileResult<()> {
        self.operation(NullaryOp::StoreLoadBarrier)
    }

    pub fn trap(&mut self) -> CompileResult<()> {
        self.operation(NullaryOp::Trap)
    }

    /// Append a word to the constant pool; the result resolves to its address.
    pub fn pool_append(&mut self, value: PromiseId) -> PromiseId {
        self.promises.pool_append(value)
    }

    pub fn pool_append_value(&mut self, value: i64) -> PromiseId {
        let promise = self.promises.resolved(value);
        self.promises.pool_append(promise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::X86Architecture;
    use bumpalo::Bump;

    struct NoHelpers;

    impl Client for NoHelpers {
        fn thunk(&self, _op: ThunkOp, _result_size: u32) -> i64 {
            0x1000
        }
    }

    #[test]
    fn test_wide_values_take_two_stack_entries() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let arch = X86Architecture::x86();
        let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
        c.init(1, 0, 2).unwrap();
        let v = c.constant(8, 0x1_0000_0002);
        let high = c.values().get(v).high.unwrap();
        c.push(8, v).unwrap();
        assert_eq!(c.peek(4, 0).unwrap(), v);
        assert_eq!(c.peek(4, 1).unwrap(), high);
        assert_eq!(c.pop(8).unwrap(), v);
        assert!(c.pop(4).is_err());
    }

    #[test]
    fn test_parameters_arrive_in_argument_registers() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let arch = X86Architecture::x86_64();
        let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
        c.init(1, 7, 8).unwrap();
        c.init_local(8, 0, ValueType::Integer).unwrap();
        c.init_local(8, 6, ValueType::Integer).unwrap();
        assert!(matches!(
            c.events().get(EventId(0)).kind,
            EventKind::RegisterSite { register: 7, .. }
        ));
        assert!(matches!(
            c.events().get(EventId(1)).kind,
            EventKind::FrameSite {
                home: FrameHome::Local(6),
                ..
            }
        ));
        assert_eq!(c.frame_layout().parameter_footprint, 1);
    }

    #[test]
    fn test_misuse_is_rejected() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let arch = X86Architecture::x86_64();
        let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
        assert!(c.start_logical_ip(0).is_err());
        c.init(2, 0, 1).unwrap();
        assert!(c.init(2, 0, 1).is_err());
        assert!(c.visit_logical_ip(1).is_err());
        assert!(c.load_local(8, 0).is_err());
        c.start_logical_ip(0).unwrap();
        assert!(c.start_logical_ip(0).is_err());
        assert!(c.start_logical_ip(5).is_err());
    }

    #[test]
    fn test_thunked_operation_becomes_call() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let arch = X86Architecture::x86();
        let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
        c.init(1, 0, 0).unwrap();
        c.start_logical_ip(0).unwrap();
        let a = c.constant(8, 3);
        let b = c.constant(8, 4);
        let product = c.binary_op(TernaryOp::Multiply, 8, a, b).unwrap();
        assert!(c.values().get(product).high.is_some());
        let call = EventId(c.events().len() - 1);
        match &c.events().get(call).kind {
            EventKind::Call { arguments, .. } => {
                assert_eq!(arguments[0].value, b);
                assert_eq!(arguments[1].value, a);
            }
            other => panic!("expected a call, got {other:?}"),
        }
        // Four argument words plus the helper address.
        assert_eq!(c.events().get(call).reads.len(), 5);
        assert_eq!(c.stats().thunks_used, 1);
        assert_eq!(c.frame_layout().outgoing_footprint, 4);
    }
}
