use rand::Rng;
use serde::{Deserialize, Serialize};

use super::frame::{ExceptionCode, RegisterBank, COIL_OFF, COIL_ON};

/// Upper bound of the simulated measurement range. Initial values and drift
/// both stay within 0..=DRIFT_VALUE_MAX; explicit client writes may exceed it
/// until the next drift of that cell pulls the value back into range.
pub const DRIFT_VALUE_MAX: u16 = 20;

/// Probability that a single cell mutates on one drift tick.
pub const DRIFT_PROBABILITY: f64 = 0.2;

/// Bank sizes of the simulated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankLayout {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl Default for BankLayout {
    fn default() -> Self {
        Self {
            coils: 10,
            discrete_inputs: 10,
            holding_registers: 20,
            input_registers: 20,
        }
    }
}

/// Values read from one bank: booleans for bit banks, 16-bit words otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankValues {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

impl BankValues {
    pub fn len(&self) -> usize {
        match self {
            BankValues::Bits(bits) => bits.len(),
            BankValues::Words(words) => words.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory register banks of one device. Callers share the store behind a
/// single mutex; every read, write and drift pass holds it for the whole
/// operation and never across I/O.
#[derive(Debug)]
pub struct RegisterStore {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

impl RegisterStore {
    pub fn new(layout: &BankLayout) -> Self {
        Self {
            coils: vec![false; layout.coils],
            discrete_inputs: vec![false; layout.discrete_inputs],
            holding_registers: vec![0; layout.holding_registers],
            input_registers: vec![0; layout.input_registers],
        }
    }

    /// Device startup state: random booleans, registers in 0..=20.
    pub fn randomized<R: Rng>(layout: &BankLayout, rng: &mut R) -> Self {
        let mut store = Self::new(layout);
        for bit in store.coils.iter_mut().chain(store.discrete_inputs.iter_mut()) {
            *bit = rng.gen_bool(0.5);
        }
        for word in store
            .holding_registers
            .iter_mut()
            .chain(store.input_registers.iter_mut())
        {
            *word = rng.gen_range(0..=DRIFT_VALUE_MAX);
        }
        store
    }

    pub fn len(&self, bank: RegisterBank) -> usize {
        match bank {
            RegisterBank::Coils => self.coils.len(),
            RegisterBank::DiscreteInputs => self.discrete_inputs.len(),
            RegisterBank::HoldingRegisters => self.holding_registers.len(),
            RegisterBank::InputRegisters => self.input_registers.len(),
        }
    }

    fn check_range(&self, bank: RegisterBank, start: u16, count: u16) -> Result<(), ExceptionCode> {
        if count == 0 {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let end = start as usize + count as usize;
        if end > self.len(bank) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    pub fn read(
        &self,
        bank: RegisterBank,
        start: u16,
        count: u16,
    ) -> Result<BankValues, ExceptionCode> {
        self.check_range(bank, start, count)?;
        let range = start as usize..start as usize + count as usize;
        let values = match bank {
            RegisterBank::Coils => BankValues::Bits(self.coils[range].to_vec()),
            RegisterBank::DiscreteInputs => BankValues::Bits(self.discrete_inputs[range].to_vec()),
            RegisterBank::HoldingRegisters => {
                BankValues::Words(self.holding_registers[range].to_vec())
            }
            RegisterBank::InputRegisters => BankValues::Words(self.input_registers[range].to_vec()),
        };
        Ok(values)
    }

    /// Write one coil from its raw wire value: 0xFF00 = ON, 0x0000 = OFF,
    /// anything else is IllegalDataValue.
    pub fn write_coil(&mut self, address: u16, raw: u16) -> Result<(), ExceptionCode> {
        let on = match raw {
            COIL_ON => true,
            COIL_OFF => false,
            _ => return Err(ExceptionCode::IllegalDataValue),
        };
        self.check_range(RegisterBank::Coils, address, 1)?;
        self.coils[address as usize] = on;
        Ok(())
    }

    pub fn write_register(&mut self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        self.check_range(RegisterBank::HoldingRegisters, address, 1)?;
        self.holding_registers[address as usize] = value;
        Ok(())
    }

    /// Direct cell mutation, bypassing protocol rules. Used by the simulator
    /// to seed read-only banks.
    pub fn set_discrete_input(&mut self, address: u16, on: bool) -> Result<(), ExceptionCode> {
        self.check_range(RegisterBank::DiscreteInputs, address, 1)?;
        self.discrete_inputs[address as usize] = on;
        Ok(())
    }

    pub fn set_input_register(&mut self, address: u16, value: u16) -> Result<(), ExceptionCode> {
        self.check_range(RegisterBank::InputRegisters, address, 1)?;
        self.input_registers[address as usize] = value;
        Ok(())
    }

    /// One simulation tick: each cell independently mutates with probability
    /// DRIFT_PROBABILITY. Bits flip; registers move by a random delta in
    /// -2..=2 and are clamped to 0..=DRIFT_VALUE_MAX.
    pub fn drift<R: Rng>(&mut self, rng: &mut R) {
        for bit in self.coils.iter_mut().chain(self.discrete_inputs.iter_mut()) {
            if rng.gen_bool(DRIFT_PROBABILITY) {
                *bit = !*bit;
            }
        }
        for word in self
            .holding_registers
            .iter_mut()
            .chain(self.input_registers.iter_mut())
        {
            if rng.gen_bool(DRIFT_PROBABILITY) {
                let delta = rng.gen_range(-2i32..=2);
                let next = (*word as i32 + delta).clamp(0, DRIFT_VALUE_MAX as i32);
                *word = next as u16;
            }
        }
    }
}
