use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationKind, BufferAllocation};
use crate::constants::ConstantInfo;
use crate::device::GpuVersion;
use crate::env::DebugOptions;
use crate::error::{ExecError, ExecResult};
use crate::output::{AliasConfig, AliasKind, OutputInfo};
use crate::shape::{Shape, ShapeIndex};

fn default_used() -> bool {
    true
}

/// One argument of a runtime entry point, i.e. one buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryArgument {
    /// Static byte size of the rank-1 buffer.
    pub size: u64,
    #[serde(default)]
    pub parameter: Option<usize>,
    #[serde(default)]
    pub parameter_shape_index: Vec<usize>,
    /// Output shape index this argument backs.
    #[serde(default)]
    pub output_index: Option<Vec<usize>>,
    #[serde(default)]
    pub must_alias: bool,
    #[serde(default)]
    pub constant_name: Option<String>,
    /// Unused arguments are passed through unmodified.
    #[serde(default = "default_used")]
    pub used: bool,
}

impl EntryArgument {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            parameter: None,
            parameter_shape_index: Vec::new(),
            output_index: None,
            must_alias: false,
            constant_name: None,
            used: true,
        }
    }
}

/// Signature of an ahead-of-time compiled entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySignature {
    pub result_shape: Shape,
    pub arguments: Vec<EntryArgument>,
}

/// Allocation layout recovered from an [`EntrySignature`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntryLayout {
    pub allocations: Vec<BufferAllocation>,
    pub output_info: BTreeMap<ShapeIndex, OutputInfo>,
    pub constants: Vec<ConstantInfo>,
    pub buffer_sizes: Vec<u64>,
}

impl EntrySignature {
    pub fn parse(module: &str) -> ExecResult<Self> {
        serde_json::from_str(module).map_err(|err| {
            ExecError::internal(format!("failed to parse ahead-of-time compiled module: {err}"))
        })
    }

    pub fn to_json(&self) -> ExecResult<String> {
        serde_json::to_string(self).map_err(|err| {
            ExecError::internal(format!("failed to serialize entry signature: {err}"))
        })
    }

    pub fn layout(&self) -> ExecResult<EntryLayout> {
        let mut layout = EntryLayout {
            allocations: Vec::with_capacity(self.arguments.len()),
            output_info: BTreeMap::new(),
            constants: Vec::new(),
            buffer_sizes: Vec::with_capacity(self.arguments.len()),
        };

        for (index, argument) in self.arguments.iter().enumerate() {
            let kind = match (argument.parameter, &argument.constant_name) {
                (Some(parameter_number), _) => AllocationKind::EntryParameter {
                    parameter_number,
                    parameter_shape_index: ShapeIndex::from(argument.parameter_shape_index.clone()),
                    maybe_live_out: argument.output_index.is_some(),
                },
                (None, Some(name)) => {
                    // Module globals carry their own initializers.
                    layout
                        .constants
                        .push(ConstantInfo::new(name.as_str(), Vec::<u8>::new(), Some(index)));
                    AllocationKind::Constant
                }
                (None, None) if argument.output_index.is_some() => AllocationKind::MaybeLiveOut,
                (None, None) => AllocationKind::Temp,
            };
            layout
                .allocations
                .push(BufferAllocation::new(index, argument.size, kind));
            layout.buffer_sizes.push(argument.size);

            let Some(output_index) = &argument.output_index else {
                continue;
            };
            let output_index = ShapeIndex::from(output_index.clone());
            if self.result_shape.subshape(&output_index).is_none() {
                return Err(ExecError::internal(format!(
                    "argument {index} backs output {output_index}, which is not part of {}",
                    self.result_shape
                )));
            }
            let mut info = OutputInfo::new(index).with_passthrough(!argument.used);
            if let Some(parameter_number) = argument.parameter {
                let kind = if argument.must_alias {
                    AliasKind::MustAlias
                } else {
                    AliasKind::MayAlias
                };
                info = info.with_alias(AliasConfig::new(
                    parameter_number,
                    argument.parameter_shape_index.clone(),
                    kind,
                ));
            }
            if layout.output_info.insert(output_index.clone(), info).is_some() {
                return Err(ExecError::internal(format!(
                    "output {output_index} is backed by more than one argument"
                )));
            }
        }
        Ok(layout)
    }
}

/// Everything needed to rebuild an executable from an ahead-of-time compiled runtime program.
#[derive(Debug, Clone)]
pub struct RuntimeArtifact {
    pub module_name: String,
    pub entry_point: String,
    pub obj_file: Vec<u8>,
    /// Serialized [`EntrySignature`] of the module behind `obj_file`.
    pub runtime_module: String,
    pub asm_text: String,
    pub binary: Vec<u8>,
    pub gpu_version: GpuVersion,
    pub debug_options: DebugOptions,
}
