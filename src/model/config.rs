#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layer: usize,
    pub max_seq_len: usize,
    pub mixer: MixerConfig,
    pub state_mixer: StateMixerConfig,
    pub learned_pos: bool,
    pub tie_weights: bool,
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 8192,
            d_model: 128,
            n_layer: 2,
            max_seq_len: 256,
            mixer: MixerConfig::TimeMix(TimeMixConfig::default()),
            state_mixer: StateMixerConfig::Mlp { expand: 4 },
            learned_pos: false,
            tie_weights: true,
            dropout: 0.0,
        }
    }
}

impl ModelConfig {
    /// Mixer configuration for a given layer, cycling through hybrid stacks.
    pub fn mixer_for_layer(&self, layer: usize) -> &MixerConfig {
        match &self.mixer {
            MixerConfig::Hybrid(order) => &order[layer % order.len()],
            single => single,
        }
    }
}

#[derive(Clone, Debug)]
pub enum MixerConfig {
    TimeMix(TimeMixConfig),
    Attention(AttentionConfig),
    Conv(ConvConfig),
    Linear(LinearAttentionConfig),
    /// Cycle through the listed mixers, one per layer.
    Hybrid(Vec<MixerConfig>),
}

#[derive(Clone, Debug)]
pub struct TimeMixConfig {
    pub n_head: usize,
    /// Rank of the low-rank interpolation adjustments.
    pub mix_rank: usize,
    /// Rank of the data-dependent decay projection.
    pub decay_rank: usize,
    /// Scale keys by `1 - decay` so fully-retained channels ignore new keys.
    pub key_retention: bool,
}

impl Default for TimeMixConfig {
    fn default() -> Self {
        Self {
            n_head: 2,
            mix_rank: 32,
            decay_rank: 64,
            key_retention: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AttentionConfig {
    pub n_head: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self { n_head: 2 }
    }
}

#[derive(Clone, Debug)]
pub struct ConvConfig {
    pub kernel_size: usize,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self { kernel_size: 3 }
    }
}

#[derive(Clone, Debug)]
pub struct LinearAttentionConfig {
    pub n_head: usize,
    /// Projected feature dimension fed to the second-order feature map.
    pub feature_dim: usize,
}

impl Default for LinearAttentionConfig {
    fn default() -> Self {
        Self {
            n_head: 2,
            feature_dim: 16,
        }
    }
}

#[derive(Clone, Debug)]
pub enum StateMixerConfig {
    Identity,
    Mlp { expand: usize },
    Glu { expand: usize },
}
