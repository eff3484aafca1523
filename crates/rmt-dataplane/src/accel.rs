//! Accelerator registries and kernels.
//!
//! The switch carries a small fixed-function accelerator next to the match
//! pipeline: a MAC-plus-activation kernel over pre-loaded weight/bias
//! contexts, and preloaded input→output lookup tables for sigmoid and exp.
//! The registries here are owned by the pipeline and handed to the
//! expression evaluator by reference; each is mutex-guarded with copy-out
//! snapshots, so the packet path never holds a registry lock while
//! computing.
//!
//! All kernel inputs and outputs are fixed-point with 16-bit elements; a
//! context asking for a different element width is coerced with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::codec::{self, Data};
use crate::error::{DataplaneError, Result};

/// Fixed element width of the neuron primitive, in bits.
pub const FIXED_POINT_BITS: u32 = rmt_chip::geometry::NEURON_IO_BITS;

/// Fixed-point shift applied after accumulation.
pub const FIXED_POINT_SHIFT: u32 = 16;

/// Post-accumulation activation of a neuron context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Activation {
    /// Shift and clamp only.
    #[default]
    None,
    /// Negative accumulations clamp to zero.
    Relu,
    /// Route the shifted accumulation through the sigmoid table.
    Sigmoid,
}

/// One pre-loaded weight/bias context for the neuron primitive.
#[derive(Debug, Clone)]
pub struct NeuronContext {
    /// Registry key.
    pub context_id: u16,
    /// Input vector length.
    pub num_inputs: u32,
    /// Neurons (output vector length).
    pub num_neurons: u32,
    /// Requested input element width; the kernel forces 16.
    pub input_bitwidth: u32,
    /// Requested output element width; the kernel forces 16.
    pub output_bitwidth: u32,
    /// Whether input elements are sign-extended.
    pub inputs_signed: bool,
    /// Whether weights are signed (informational; weights are stored as i32).
    pub weights_signed: bool,
    /// Row-major weights, `num_neurons × num_inputs`.
    pub weights: Vec<i32>,
    /// One bias per neuron.
    pub biases: Vec<i32>,
    /// Activation applied after the shift.
    pub activation: Activation,
}

/// Registry of neuron contexts keyed by context id.
///
/// Reads take an `Arc` snapshot of the context, so a concurrent upsert never
/// mutates a context a packet is computing with.
#[derive(Debug, Default)]
pub struct NeuronRegistry {
    contexts: Mutex<HashMap<u16, Arc<NeuronContext>>>,
}

impl NeuronRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and install a context, replacing any previous one with the
    /// same id.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a dimension is zero or the
    /// weight/bias vectors disagree with the dimensions. Nothing is
    /// installed on error.
    pub fn upsert(&self, ctx: NeuronContext) -> Result<()> {
        if ctx.num_inputs == 0 || ctx.num_neurons == 0 {
            return Err(DataplaneError::config_invalid(
                "neuron context must specify non-zero inputs and neurons",
            ));
        }
        let expected_weights = u64::from(ctx.num_inputs) * u64::from(ctx.num_neurons);
        if ctx.weights.len() as u64 != expected_weights {
            return Err(DataplaneError::config_invalid(format!(
                "weights size mismatch: got {}, expected {}×{}={}",
                ctx.weights.len(),
                ctx.num_neurons,
                ctx.num_inputs,
                expected_weights
            )));
        }
        if ctx.biases.len() != ctx.num_neurons as usize {
            return Err(DataplaneError::config_invalid(format!(
                "biases size mismatch: got {}, expected {}",
                ctx.biases.len(),
                ctx.num_neurons
            )));
        }
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.insert(ctx.context_id, Arc::new(ctx));
        Ok(())
    }

    /// Snapshot a context.
    #[must_use]
    pub fn get(&self, context_id: u16) -> Option<Arc<NeuronContext>> {
        let contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.get(&context_id).cloned()
    }

    /// Remove one context. Returns whether it existed.
    pub fn erase(&self, context_id: u16) -> bool {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.remove(&context_id).is_some()
    }

    /// Remove every context.
    pub fn clear(&self) {
        let mut contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.clear();
    }

    /// Number of loaded contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        let contexts = self.contexts.lock().unwrap_or_else(|e| e.into_inner());
        contexts.len()
    }

    /// Whether no contexts are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loaded sigmoid table contents (immutable snapshot).
#[derive(Debug, Clone)]
pub struct SigmoidSnapshot {
    /// Smallest scaled input covered.
    pub min_input: i32,
    /// Largest scaled input covered.
    pub max_input: i32,
    /// Bit width every stored value fits in.
    pub value_bitwidth: u32,
    /// Inputs are multiplied by this before clamping into the range.
    pub input_multiplier: u32,
    /// One value per scaled input in `[min_input, max_input]`.
    pub values: Vec<u32>,
}

impl SigmoidSnapshot {
    /// Scale, clamp and look up an input.
    #[must_use]
    pub fn lookup(&self, input: i32) -> u32 {
        let scaled = i64::from(input) * i64::from(self.input_multiplier);
        let clamped = scaled.clamp(i64::from(self.min_input), i64::from(self.max_input));
        self.values[(clamped - i64::from(self.min_input)) as usize]
    }
}

/// The single loaded sigmoid table.
#[derive(Debug, Default)]
pub struct SigmoidTable {
    inner: Mutex<Option<Arc<SigmoidSnapshot>>>,
}

impl SigmoidTable {
    /// Empty (unloaded) table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and atomically replace the loaded table.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the range is inverted, the value
    /// vector does not cover the range, the bit width is outside `1..=32`,
    /// a value does not fit the bit width, or the multiplier is zero.
    pub fn load(
        &self,
        min_input: i32,
        max_input: i32,
        value_bitwidth: u32,
        input_multiplier: u32,
        values: Vec<u32>,
    ) -> Result<()> {
        if min_input > max_input {
            return Err(DataplaneError::config_invalid("sigmoid table: invalid range"));
        }
        let expected = (i64::from(max_input) - i64::from(min_input) + 1) as usize;
        if values.len() != expected {
            return Err(DataplaneError::config_invalid(format!(
                "sigmoid table: expected {expected} entries but received {}",
                values.len()
            )));
        }
        if value_bitwidth == 0 || value_bitwidth > 32 {
            return Err(DataplaneError::config_invalid(format!(
                "sigmoid table: unsupported value width {value_bitwidth}"
            )));
        }
        if input_multiplier == 0 {
            return Err(DataplaneError::config_invalid(
                "sigmoid table: input multiplier cannot be zero",
            ));
        }
        let mask = codec::mask_u64(value_bitwidth);
        if let Some(v) = values.iter().find(|&&v| u64::from(v) > mask) {
            return Err(DataplaneError::config_invalid(format!(
                "sigmoid table: value {v} exceeds {value_bitwidth} bits"
            )));
        }
        let snapshot = Arc::new(SigmoidSnapshot {
            min_input,
            max_input,
            value_bitwidth,
            input_multiplier,
            values,
        });
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        Ok(())
    }

    /// Drop the loaded table.
    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether a table is loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Snapshot the loaded table, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<SigmoidSnapshot>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Loaded exp table contents (immutable snapshot).
///
/// Same shape as the sigmoid table plus a value scale. Configuration is
/// accepted and stored, but no expression opcode reads it yet; `lookup`
/// exists so wiring such an opcode is a local change.
#[derive(Debug, Clone)]
pub struct ExpSnapshot {
    /// Smallest scaled input covered.
    pub min_input: i32,
    /// Largest scaled input covered.
    pub max_input: i32,
    /// Inputs are multiplied by this before clamping into the range.
    pub input_multiplier: u32,
    /// Fixed-point scale the stored values were multiplied by.
    pub value_scale: u32,
    /// One value per scaled input in `[min_input, max_input]`.
    pub values: Vec<u32>,
}

impl ExpSnapshot {
    /// Scale, clamp and look up an input.
    #[must_use]
    pub fn lookup(&self, input: i32) -> u32 {
        let scaled = i64::from(input) * i64::from(self.input_multiplier);
        let clamped = scaled.clamp(i64::from(self.min_input), i64::from(self.max_input));
        self.values[(clamped - i64::from(self.min_input)) as usize]
    }
}

/// The single loaded exp table.
#[derive(Debug, Default)]
pub struct ExpTable {
    inner: Mutex<Option<Arc<ExpSnapshot>>>,
}

impl ExpTable {
    /// Empty (unloaded) table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and atomically replace the loaded table.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the range is inverted, the value
    /// vector does not cover the range, or a scale factor is zero.
    pub fn load(
        &self,
        min_input: i32,
        max_input: i32,
        input_multiplier: u32,
        value_scale: u32,
        values: Vec<u32>,
    ) -> Result<()> {
        if min_input > max_input {
            return Err(DataplaneError::config_invalid("exp table: invalid range"));
        }
        let expected = (i64::from(max_input) - i64::from(min_input) + 1) as usize;
        if values.len() != expected {
            return Err(DataplaneError::config_invalid(format!(
                "exp table: expected {expected} entries but received {}",
                values.len()
            )));
        }
        if input_multiplier == 0 {
            return Err(DataplaneError::config_invalid(
                "exp table: input multiplier cannot be zero",
            ));
        }
        if value_scale == 0 {
            return Err(DataplaneError::config_invalid(
                "exp table: value scale cannot be zero",
            ));
        }
        let snapshot = Arc::new(ExpSnapshot {
            min_input,
            max_input,
            input_multiplier,
            value_scale,
            values,
        });
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
        Ok(())
    }

    /// Drop the loaded table.
    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether a table is loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Snapshot the loaded table, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<ExpSnapshot>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Clamp a signed value into `[0, 2^width − 1]`.
#[must_use]
pub fn clamp_to_width(value: i64, width: u32) -> u64 {
    let width = if width == 0 { 32 } else { width };
    let max = codec::mask_u64(width.min(32)) as i64;
    value.clamp(0, max) as u64
}

/// Rescale an unsigned value from one bit width's full range to another's.
///
/// Equal widths clamp only; differing widths map proportionally with
/// round-to-nearest. A zero `from_width` is treated as 16.
#[must_use]
pub fn rescale_value(value: u64, from_width: u32, to_width: u32) -> u64 {
    let from_width = if from_width == 0 { 16 } else { from_width };
    if to_width == 0 || to_width == from_width {
        let target = if to_width == 0 { from_width } else { to_width };
        return value.min(codec::mask_u64(target.min(32)));
    }
    let from_max = codec::mask_u64(from_width.min(32)) as f64;
    let to_max = codec::mask_u64(to_width.min(32)) as f64;
    if from_max <= 0.0 {
        return 0;
    }
    let ratio = (value as f64 / from_max).clamp(0.0, 1.0);
    (ratio * to_max).round() as u64
}

/// Run one neuron-primitive invocation.
///
/// The feature blob is `num_inputs` elements of 16 bits packed
/// left-to-right. Each neuron accumulates `(bias << 16) + Σ feature·weight`,
/// shifts down by 16, applies the activation, and the results are packed at
/// 16 bits each.
///
/// # Errors
///
/// Returns an accelerator error when the feature blob is too short, or when
/// sigmoid activation is requested with no table loaded.
pub fn run_neuron_primitive(
    ctx: &NeuronContext,
    features: &Data,
    sigmoid: Option<&SigmoidSnapshot>,
) -> Result<Data> {
    if ctx.input_bitwidth != FIXED_POINT_BITS && ctx.input_bitwidth != 0 {
        warn!(
            context_id = ctx.context_id,
            requested = ctx.input_bitwidth,
            "forcing neuron input width to {FIXED_POINT_BITS} bits"
        );
    }
    if ctx.output_bitwidth != FIXED_POINT_BITS && ctx.output_bitwidth != 0 {
        warn!(
            context_id = ctx.context_id,
            requested = ctx.output_bitwidth,
            "forcing neuron output width to {FIXED_POINT_BITS} bits"
        );
    }

    let raw = codec::extract_chunks(features, FIXED_POINT_BITS, ctx.num_inputs).map_err(|_| {
        DataplaneError::accel(
            "neuron primitive",
            format!(
                "insufficient feature bits: need {}, have {}",
                FIXED_POINT_BITS * ctx.num_inputs,
                features.bits()
            ),
        )
    })?;
    let inputs: Vec<i64> = raw
        .iter()
        .map(|&chunk| {
            if ctx.inputs_signed {
                i64::from(Data::from_u32(FIXED_POINT_BITS, chunk as u32).as_i32())
            } else {
                chunk as i64
            }
        })
        .collect();

    let mut outputs = Vec::with_capacity(ctx.num_neurons as usize);
    for neuron in 0..ctx.num_neurons as usize {
        let mut acc = i64::from(ctx.biases[neuron]) << FIXED_POINT_SHIFT;
        for (input_idx, &feature) in inputs.iter().enumerate() {
            let weight = i64::from(ctx.weights[neuron * ctx.num_inputs as usize + input_idx]);
            acc += feature * weight;
        }
        let shifted = acc >> FIXED_POINT_SHIFT;
        let encoded = match ctx.activation {
            Activation::Sigmoid => {
                let table = sigmoid.ok_or(DataplaneError::SigmoidNotLoaded)?;
                let looked_up = table.lookup(shifted as i32);
                rescale_value(u64::from(looked_up), table.value_bitwidth, FIXED_POINT_BITS)
            }
            Activation::Relu => clamp_to_width(shifted.max(0), FIXED_POINT_BITS),
            Activation::None => clamp_to_width(shifted, FIXED_POINT_BITS),
        };
        outputs.push(encoded);
    }

    Ok(codec::pack_chunks(&outputs, FIXED_POINT_BITS))
}

/// Apply the sigmoid lookup to an input value.
///
/// The input is sign-extended from its own width; the result is rescaled
/// from the table's value width to `desired_bits` (or kept at the table's
/// width when `desired_bits` is zero).
#[must_use]
pub fn sigmoid_lookup(table: &SigmoidSnapshot, input: &Data, desired_bits: u32) -> Data {
    let raw = input.as_i32();
    let mut width = if desired_bits == 0 {
        table.value_bitwidth
    } else {
        desired_bits
    };
    if width == 0 || width > 32 {
        width = 32;
    }
    let value = rescale_value(u64::from(table.lookup(raw)), table.value_bitwidth, width);
    codec::pack_chunks(&[value], width)
}
