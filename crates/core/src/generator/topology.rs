//! Declarative U-Net generator topology.
//!
//! The network is an ordered list of [`Block`]s, each an ordered list of named
//! [`Stage`]s. Stage names are the PyTorch module paths of the exported
//! `state_dict` (`down2.model.1`, `final.0`, ...), so parameter names and
//! shapes fall straight out of the descriptors and persisted weights can be
//! matched against them exactly.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

pub const KERNEL_SIZE: usize = 4;
pub const STRIDE: usize = 2;
pub const PADDING: usize = 1;
pub const INSTANCE_NORM_EPSILON: f32 = 1e-5;
pub const LEAKY_RELU_SLOPE: f32 = 0.2;
pub const DROPOUT_P: f32 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    /// Strided 4×4 convolution, halves spatial resolution.
    Conv {
        in_channels: usize,
        out_channels: usize,
        bias: bool,
    },
    /// Strided 4×4 transposed convolution, doubles spatial resolution.
    ConvTranspose {
        in_channels: usize,
        out_channels: usize,
        bias: bool,
    },
    /// Affine instance normalization without running statistics.
    InstanceNorm { channels: usize },
    LeakyRelu { slope: f32 },
    Relu,
    /// Identity at inference; kept so stage indices line up with the weights.
    Dropout { p: f32 },
    Tanh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
}

impl Stage {
    /// Learned parameters this stage expects, in `state_dict` order.
    pub fn parameters(&self) -> Vec<ParamSpec> {
        let param = |suffix: &str, shape: Vec<usize>| ParamSpec {
            name: format!("{}.{suffix}", self.name),
            shape,
        };

        match &self.kind {
            StageKind::Conv {
                in_channels,
                out_channels,
                bias,
            } => {
                let mut params = vec![param(
                    "weight",
                    vec![*out_channels, *in_channels, KERNEL_SIZE, KERNEL_SIZE],
                )];
                if *bias {
                    params.push(param("bias", vec![*out_channels]));
                }
                params
            }
            // PyTorch stores transposed-conv kernels as [in, out, kH, kW].
            StageKind::ConvTranspose {
                in_channels,
                out_channels,
                bias,
            } => {
                let mut params = vec![param(
                    "weight",
                    vec![*in_channels, *out_channels, KERNEL_SIZE, KERNEL_SIZE],
                )];
                if *bias {
                    params.push(param("bias", vec![*out_channels]));
                }
                params
            }
            StageKind::InstanceNorm { channels } => vec![
                param("weight", vec![*channels]),
                param("bias", vec![*channels]),
            ],
            StageKind::LeakyRelu { .. }
            | StageKind::Relu
            | StageKind::Dropout { .. }
            | StageKind::Tanh => Vec::new(),
        }
    }

    fn channel_change(&self) -> Option<(usize, usize)> {
        match &self.kind {
            StageKind::Conv {
                in_channels,
                out_channels,
                ..
            }
            | StageKind::ConvTranspose {
                in_channels,
                out_channels,
                ..
            } => Some((*in_channels, *out_channels)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRole {
    /// Encoder stage; its output is kept for a later skip connection.
    Down,
    /// Decoder stage; output is concatenated with `skip` along channels.
    Up { skip: String },
    /// Final projection back to image channels.
    Output,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub role: BlockRole,
    pub stages: Vec<Stage>,
}

impl Block {
    fn new(name: &str, role: BlockRole, kinds: Vec<StageKind>) -> Self {
        let stages = kinds
            .into_iter()
            .enumerate()
            .map(|(index, kind)| Stage {
                name: stage_name(name, &role, index),
                kind,
            })
            .collect();

        Self {
            name: name.to_string(),
            role,
            stages,
        }
    }

    /// Encoder block: conv → [instance norm] → leaky relu → [dropout].
    pub fn down(name: &str, in_channels: usize, out_channels: usize, normalize: bool, dropout: f32) -> Self {
        let mut kinds = vec![StageKind::Conv {
            in_channels,
            out_channels,
            bias: false,
        }];
        if normalize {
            kinds.push(StageKind::InstanceNorm {
                channels: out_channels,
            });
        }
        kinds.push(StageKind::LeakyRelu {
            slope: LEAKY_RELU_SLOPE,
        });
        if dropout > 0.0 {
            kinds.push(StageKind::Dropout { p: dropout });
        }
        Self::new(name, BlockRole::Down, kinds)
    }

    /// Decoder block: transposed conv → instance norm → relu → [dropout], then skip concat.
    pub fn up(name: &str, in_channels: usize, out_channels: usize, dropout: f32, skip: &str) -> Self {
        let mut kinds = vec![
            StageKind::ConvTranspose {
                in_channels,
                out_channels,
                bias: false,
            },
            StageKind::InstanceNorm {
                channels: out_channels,
            },
            StageKind::Relu,
        ];
        if dropout > 0.0 {
            kinds.push(StageKind::Dropout { p: dropout });
        }
        Self::new(
            name,
            BlockRole::Up {
                skip: skip.to_string(),
            },
            kinds,
        )
    }

    pub fn output(name: &str, in_channels: usize, out_channels: usize) -> Self {
        Self::new(
            name,
            BlockRole::Output,
            vec![
                StageKind::ConvTranspose {
                    in_channels,
                    out_channels,
                    bias: true,
                },
                StageKind::Tanh,
            ],
        )
    }

    pub fn parameters(&self) -> Vec<ParamSpec> {
        self.stages.iter().flat_map(Stage::parameters).collect()
    }

    /// Channels entering the block's first resampling stage.
    pub fn in_channels(&self) -> Option<usize> {
        self.stages
            .iter()
            .find_map(Stage::channel_change)
            .map(|(i, _)| i)
    }

    /// Channels leaving the resampling stage, before any skip concatenation.
    pub fn out_channels(&self) -> Option<usize> {
        self.stages
            .iter()
            .rev()
            .find_map(Stage::channel_change)
            .map(|(_, o)| o)
    }
}

// UNetDown/UNetUp wrap their layers in `self.model`, the final head is a bare Sequential.
fn stage_name(block: &str, role: &BlockRole, index: usize) -> String {
    match role {
        BlockRole::Output => format!("{block}.{index}"),
        BlockRole::Down | BlockRole::Up { .. } => format!("{block}.model.{index}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub image_channels: usize,
    pub blocks: Vec<Block>,
}

impl Topology {
    /// The 7-down / 6-up generator every shipped model variant was trained with.
    pub fn unet(image_channels: usize) -> Self {
        let c = image_channels;
        let blocks = vec![
            Block::down("down1", c, 64, false, 0.0),
            Block::down("down2", 64, 128, true, 0.0),
            Block::down("down3", 128, 256, true, 0.0),
            Block::down("down4", 256, 512, true, DROPOUT_P),
            Block::down("down5", 512, 512, true, DROPOUT_P),
            Block::down("down6", 512, 512, true, DROPOUT_P),
            Block::down("down7", 512, 512, false, DROPOUT_P),
            Block::up("up1", 512, 512, DROPOUT_P, "down6"),
            Block::up("up2", 1024, 512, DROPOUT_P, "down5"),
            Block::up("up3", 1024, 512, DROPOUT_P, "down4"),
            Block::up("up4", 1024, 256, 0.0, "down3"),
            Block::up("up5", 512, 128, 0.0, "down2"),
            Block::up("up6", 256, 64, 0.0, "down1"),
            Block::output("final", 128, c),
        ];

        Self {
            image_channels,
            blocks,
        }
    }

    /// Every learned tensor, in block order.
    pub fn parameters(&self) -> Vec<ParamSpec> {
        self.blocks.iter().flat_map(Block::parameters).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|p| p.shape.iter().product::<usize>())
            .sum()
    }

    /// Number of 2× downsampling steps between input and bottleneck.
    pub fn depth(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.role == BlockRole::Down)
            .count()
    }

    /// Input side length must survive `depth()` halvings without rounding.
    pub fn check_resolution(&self, resolution: u32) -> Result<()> {
        let factor = 1u32 << self.depth();
        if resolution == 0 || resolution % factor != 0 {
            bail!("resolution {resolution} is not a positive multiple of {factor}");
        }
        Ok(())
    }

    /// Walk the blocks and check channel counts, skip wiring, and that every
    /// skip joins an encoder output at the same spatial scale.
    pub fn validate(&self) -> Result<()> {
        let mut channels = self.image_channels;
        let mut level: i64 = 0;
        let mut encoder: HashMap<&str, (usize, i64)> = HashMap::new();

        for block in &self.blocks {
            let in_ch = block
                .in_channels()
                .with_context(|| format!("block {} has no resampling stage", block.name))?;
            let out_ch = block
                .out_channels()
                .with_context(|| format!("block {} has no resampling stage", block.name))?;

            if in_ch != channels {
                bail!(
                    "block {} consumes {in_ch} channels but receives {channels}",
                    block.name
                );
            }

            for stage in &block.stages {
                if let StageKind::InstanceNorm { channels: norm } = stage.kind {
                    if norm != out_ch {
                        bail!(
                            "stage {} normalizes {norm} channels, block produces {out_ch}",
                            stage.name
                        );
                    }
                }
            }

            channels = out_ch;
            match &block.role {
                BlockRole::Down => {
                    level += 1;
                    encoder.insert(block.name.as_str(), (out_ch, level));
                }
                BlockRole::Up { skip } => {
                    level -= 1;
                    let (skip_ch, skip_level) = *encoder.get(skip.as_str()).with_context(|| {
                        format!("block {} skips from unknown encoder block {skip}", block.name)
                    })?;
                    if skip_level != level {
                        bail!(
                            "block {} joins {skip} across resolutions (scale {level} vs {skip_level})",
                            block.name
                        );
                    }
                    channels += skip_ch;
                }
                BlockRole::Output => {
                    level -= 1;
                }
            }
        }

        if level != 0 {
            bail!("generator output is at scale {level}, expected input resolution");
        }
        if channels != self.image_channels {
            bail!(
                "generator emits {channels} channels, expected {}",
                self.image_channels
            );
        }
        Ok(())
    }
}
