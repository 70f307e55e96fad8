//! ResNet-style bottleneck backbone
//!
//! The backbone ends at its last convolution stage; there is no
//! classification layer to discard. It is organised as an ordered list of
//! *units* (the stem, then every bottleneck block) so training can freeze a
//! prefix and fine-tune the rest.

use std::path::Path;

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};
use burn_store::{
    ApplyResult, KeyRemapper, ModuleSnapshot, PyTorchToBurnAdapter, PytorchStore,
    SafetensorsStore,
};
use tracing::{debug, info};

use crate::model::config::BackboneConfig;
use crate::utils::error::{FogError, Result};

/// 7x7/2 convolution, batch norm, ReLU and 3x3/2 max-pool
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pub pool: MaxPool2d,
    pub activation: Relu,
}

impl<B: Backend> Stem<B> {
    pub fn new(out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([3, out_channels], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

/// 1x1 projection used on the residual path when shapes change
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// 1x1 reduce, 3x3 (strided), 1x1 expand, plus the residual connection
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B>,
    pub downsample: Option<Downsample<B>>,
    pub activation: Relu,
}

impl<B: Backend> Bottleneck<B> {
    pub fn new(
        in_channels: usize,
        width: usize,
        expansion: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let out_channels = width * expansion;

        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1: Conv2dConfig::new([in_channels, width], [1, 1])
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: Conv2dConfig::new([width, width], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: Conv2dConfig::new([width, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.activation.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.activation.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));

        self.activation.forward(out + identity)
    }
}

/// Stem followed by the bottleneck stages
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub stem: Stem<B>,
    pub blocks: Vec<Bottleneck<B>>,
    out_channels: usize,
}

impl BackboneConfig {
    /// Initialize a randomly weighted backbone
    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let stem = Stem::new(self.base_width, device);

        let mut blocks = Vec::with_capacity(self.num_units() - 1);
        let mut in_channels = self.base_width;
        for (stage, &num_blocks) in self.stage_blocks.iter().enumerate() {
            let width = self.stage_width(stage);
            for block in 0..num_blocks {
                let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                blocks.push(Bottleneck::new(in_channels, width, self.expansion, stride, device));
                in_channels = width * self.expansion;
            }
        }

        Backbone {
            stem,
            blocks,
            out_channels: self.out_channels(),
        }
    }
}

impl<B: Backend> Backbone<B> {
    /// Number of freezable units (stem + blocks)
    pub fn num_units(&self) -> usize {
        1 + self.blocks.len()
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_units(x, 0, self.num_units())
    }

    /// Run units `start..end` only
    pub fn forward_units(&self, x: Tensor<B, 4>, start: usize, end: usize) -> Tensor<B, 4> {
        let end = end.min(self.num_units());
        (start..end).fold(x, |x, unit| match unit {
            0 => self.stem.forward(x),
            n => self.blocks[n - 1].forward(x),
        })
    }

    /// Load pre-trained weights, picking the reader from the file extension
    ///
    /// `.pt`/`.pth` and `.safetensors` files are torchvision ResNet
    /// `state_dict`s; anything else is read as a burn record.
    pub fn load_pretrained(
        self,
        path: &Path,
        config: &BackboneConfig,
        device: &B::Device,
    ) -> Result<Self> {
        let format = WeightsFormat::from_path(path);
        let exists = match format {
            WeightsFormat::Burn => path.exists() || path.with_extension("mpk").exists(),
            _ => path.exists(),
        };
        if !exists {
            return Err(FogError::PathNotFound(path.to_path_buf()));
        }

        let backbone = match format {
            WeightsFormat::Burn => self.load_record_file(path, device)?,
            WeightsFormat::PyTorch | WeightsFormat::Safetensors => {
                self.load_torchvision(path, format, config)?
            }
        };

        info!("Loaded pre-trained backbone weights from {:?}", path);
        Ok(backbone)
    }

    fn load_record_file(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| {
                FogError::Model(format!("failed to load backbone weights from {:?}: {:?}", path, e))
            })
    }

    /// Import a torchvision ResNet checkpoint
    ///
    /// Every backbone tensor must be present with the right shape. The
    /// checkpoint's `fc.*` classifier and `num_batches_tracked` counters are
    /// left unused.
    fn load_torchvision(
        mut self,
        path: &Path,
        format: WeightsFormat,
        config: &BackboneConfig,
    ) -> Result<Self> {
        let remapper = torchvision_key_remapper(config)?;
        let import_error =
            |e: String| FogError::Model(format!("failed to import {:?}: {}", path, e));

        let result: ApplyResult = match format {
            WeightsFormat::PyTorch => {
                let mut store = PytorchStore::from_file(path).remap(remapper);
                self.load_from(&mut store).map_err(|e| import_error(e.to_string()))?
            }
            _ => {
                let mut store = SafetensorsStore::from_file(path)
                    .with_from_adapter(PyTorchToBurnAdapter)
                    .remap(remapper);
                self.load_from(&mut store).map_err(|e| import_error(e.to_string()))?
            }
        };

        info!(
            "Imported {} tensors from {:?}, {} checkpoint tensors unused",
            result.applied.len(),
            path,
            result.unused.len()
        );
        debug!("Unused checkpoint tensors: {:?}", result.unused);
        Ok(self)
    }
}

/// On-disk layout of a backbone checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightsFormat {
    /// Burn record (`.mpk`)
    Burn,
    /// torchvision `state_dict` saved with `torch.save` (`.pt`, `.pth`)
    PyTorch,
    /// torchvision `state_dict` in safetensors format
    Safetensors,
}

impl WeightsFormat {
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("pt") | Some("pth") => Self::PyTorch,
            Some("safetensors") => Self::Safetensors,
            _ => Self::Burn,
        }
    }
}

/// torchvision ResNet parameter names to backbone module paths
///
/// `conv1`/`bn1` are the stem, `layer{s}.{k}` is the k-th block of stage s
/// (counted into the flat block list), and `downsample.0`/`downsample.1` are
/// the shortcut convolution and batch norm. Batch-norm `weight`/`bias` become
/// `gamma`/`beta`.
pub fn torchvision_key_remapper(config: &BackboneConfig) -> Result<KeyRemapper> {
    let mut patterns = vec![
        (r"^conv1\.".to_string(), "stem.conv.".to_string()),
        (r"^bn1\.".to_string(), "stem.bn.".to_string()),
    ];

    let mut block_index = 0;
    for (stage, &num_blocks) in config.stage_blocks.iter().enumerate() {
        for block in 0..num_blocks {
            patterns.push((
                format!(r"^layer{}\.{}\.", stage + 1, block),
                format!("blocks.{}.", block_index),
            ));
            block_index += 1;
        }
    }

    patterns.push((r"\.downsample\.0\.".to_string(), ".downsample.conv.".to_string()));
    patterns.push((r"\.downsample\.1\.".to_string(), ".downsample.bn.".to_string()));

    // Lookup happens by module path, before the adapter sees the tensor
    patterns.push((r"(\.bn\d?)\.weight$".to_string(), "${1}.gamma".to_string()));
    patterns.push((r"(\.bn\d?)\.bias$".to_string(), "${1}.beta".to_string()));

    KeyRemapper::from_patterns(patterns)
        .map_err(|e| FogError::Model(format!("invalid checkpoint key pattern: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny() -> BackboneConfig {
        BackboneConfig::new()
            .with_stage_blocks(vec![1, 2, 1, 1])
            .with_base_width(2)
    }

    #[test]
    fn test_unit_count_and_output_shape() {
        let device = Default::default();
        let config = tiny();
        let backbone = config.init::<TestBackend>(&device);

        assert_eq!(backbone.num_units(), 6);
        assert_eq!(backbone.out_channels(), 2 * 8 * 4);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let output = backbone.forward(input);
        assert_eq!(output.dims(), [2, 64, 1, 1]);
    }

    #[test]
    fn test_forward_units_composes() {
        let device = Default::default();
        let backbone = tiny().init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);

        let full = backbone.forward(input.clone());
        let prefix = backbone.forward_units(input, 0, 3);
        let split = backbone.forward_units(prefix, 3, backbone.num_units());

        let a: Vec<f32> = full.into_data().to_vec().unwrap();
        let b: Vec<f32> = split.into_data().to_vec().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_pretrained_roundtrip() {
        let device = Default::default();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("backbone");

        let source = tiny().init::<TestBackend>(&device);
        source
            .clone()
            .save_file(path.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        let loaded = tiny()
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &tiny(), &device)
            .unwrap();

        let expected: Vec<f32> = source.stem.conv.weight.val().into_data().to_vec().unwrap();
        let actual: Vec<f32> = loaded.stem.conv.weight.val().into_data().to_vec().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_missing_pretrained_file() {
        let device = Default::default();
        for name in ["weights", "resnet50.pth", "resnet50.safetensors"] {
            let path = Path::new("/nonexistent").join(name);
            let result = tiny()
                .init::<TestBackend>(&device)
                .load_pretrained(&path, &tiny(), &device);
            assert!(matches!(result, Err(FogError::PathNotFound(_))));
        }
    }

    #[test]
    fn test_weights_format_from_extension() {
        assert_eq!(WeightsFormat::from_path(Path::new("r50.pth")), WeightsFormat::PyTorch);
        assert_eq!(WeightsFormat::from_path(Path::new("r50.PT")), WeightsFormat::PyTorch);
        assert_eq!(
            WeightsFormat::from_path(Path::new("r50.safetensors")),
            WeightsFormat::Safetensors
        );
        assert_eq!(WeightsFormat::from_path(Path::new("backbone.mpk")), WeightsFormat::Burn);
        assert_eq!(WeightsFormat::from_path(Path::new("backbone")), WeightsFormat::Burn);
    }

    /// A tensor of a torchvision `state_dict`
    struct StateTensor {
        key: String,
        shape: Vec<usize>,
        values: Vec<f32>,
    }

    /// torchvision names and shapes for every backbone tensor, plus the
    /// `fc` classifier; values are distinct per tensor
    fn torchvision_state(backbone: &Backbone<TestBackend>, config: &BackboneConfig) -> Vec<StateTensor> {
        fn push_conv(out: &mut Vec<StateTensor>, key: String, conv: &Conv2d<TestBackend>) {
            let shape = conv.weight.val().dims().to_vec();
            out.push(StateTensor { key, shape, values: Vec::new() });
        }
        fn push_bn(out: &mut Vec<StateTensor>, prefix: String, bn: &BatchNorm<TestBackend>) {
            let n = bn.gamma.val().dims()[0];
            for param in ["weight", "bias", "running_mean", "running_var"] {
                out.push(StateTensor {
                    key: format!("{}.{}", prefix, param),
                    shape: vec![n],
                    values: Vec::new(),
                });
            }
        }

        let mut tensors = Vec::new();
        push_conv(&mut tensors, "conv1.weight".to_string(), &backbone.stem.conv);
        push_bn(&mut tensors, "bn1".to_string(), &backbone.stem.bn);

        let mut blocks = backbone.blocks.iter();
        for (stage, &num_blocks) in config.stage_blocks.iter().enumerate() {
            for k in 0..num_blocks {
                let block = blocks.next().unwrap();
                let prefix = format!("layer{}.{}", stage + 1, k);
                push_conv(&mut tensors, format!("{}.conv1.weight", prefix), &block.conv1);
                push_bn(&mut tensors, format!("{}.bn1", prefix), &block.bn1);
                push_conv(&mut tensors, format!("{}.conv2.weight", prefix), &block.conv2);
                push_bn(&mut tensors, format!("{}.bn2", prefix), &block.bn2);
                push_conv(&mut tensors, format!("{}.conv3.weight", prefix), &block.conv3);
                push_bn(&mut tensors, format!("{}.bn3", prefix), &block.bn3);
                if let Some(downsample) = &block.downsample {
                    push_conv(
                        &mut tensors,
                        format!("{}.downsample.0.weight", prefix),
                        &downsample.conv,
                    );
                    push_bn(&mut tensors, format!("{}.downsample.1", prefix), &downsample.bn);
                }
            }
        }
        tensors.push(StateTensor {
            key: "fc.weight".to_string(),
            shape: vec![10, backbone.out_channels()],
            values: Vec::new(),
        });
        tensors.push(StateTensor {
            key: "fc.bias".to_string(),
            shape: vec![10],
            values: Vec::new(),
        });

        for (i, tensor) in tensors.iter_mut().enumerate() {
            let len: usize = tensor.shape.iter().product();
            // Positive values so they also make valid running variances
            tensor.values = (0..len).map(|j| 0.5 + i as f32 + j as f32 * 1e-3).collect();
        }
        tensors
    }

    /// Write tensors in the safetensors layout: header length, JSON header, raw data
    fn write_safetensors(path: &Path, tensors: &[StateTensor]) {
        let mut header = serde_json::Map::new();
        let mut data: Vec<u8> = Vec::new();
        for tensor in tensors {
            let start = data.len();
            for v in &tensor.values {
                data.extend_from_slice(&v.to_le_bytes());
            }
            header.insert(
                tensor.key.clone(),
                serde_json::json!({
                    "dtype": "F32",
                    "shape": tensor.shape,
                    "data_offsets": [start, data.len()],
                }),
            );
        }
        // torchvision also stores a step counter per batch norm
        let start = data.len();
        data.extend_from_slice(&7i64.to_le_bytes());
        header.insert(
            "bn1.num_batches_tracked".to_string(),
            serde_json::json!({ "dtype": "I64", "shape": [], "data_offsets": [start, data.len()] }),
        );

        let mut header = serde_json::to_vec(&header).unwrap();
        while header.len() % 8 != 0 {
            header.push(b' ');
        }
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&data);
        std::fs::write(path, bytes).unwrap();
    }

    fn values(tensor: Tensor<TestBackend, 1>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_torchvision_import_maps_every_tensor() {
        let device = Default::default();
        let config = tiny();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("resnet.safetensors");

        let state = torchvision_state(&config.init::<TestBackend>(&device), &config);
        write_safetensors(&path, &state);
        let lookup = |key: &str| {
            state
                .iter()
                .find(|t| t.key == key)
                .map(|t| t.values.clone())
                .unwrap()
        };

        let loaded = config
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &config, &device)
            .unwrap();

        let stem: Vec<f32> = loaded.stem.conv.weight.val().into_data().to_vec().unwrap();
        assert_eq!(stem, lookup("conv1.weight"));
        assert_eq!(values(loaded.stem.bn.gamma.val()), lookup("bn1.weight"));
        assert_eq!(values(loaded.stem.bn.beta.val()), lookup("bn1.bias"));
        assert_eq!(values(loaded.stem.bn.running_var.value()), lookup("bn1.running_var"));

        // layer2.1 is the third block in the flat list (stage 1 has one block)
        let block = &loaded.blocks[2];
        let conv2: Vec<f32> = block.conv2.weight.val().into_data().to_vec().unwrap();
        assert_eq!(conv2, lookup("layer2.1.conv2.weight"));
        assert_eq!(values(block.bn3.running_mean.value()), lookup("layer2.1.bn3.running_mean"));

        let downsample = loaded.blocks[1].downsample.as_ref().unwrap();
        let shortcut: Vec<f32> = downsample.conv.weight.val().into_data().to_vec().unwrap();
        assert_eq!(shortcut, lookup("layer2.0.downsample.0.weight"));
        assert_eq!(
            values(downsample.bn.gamma.val()),
            lookup("layer2.0.downsample.1.weight")
        );
    }

    #[test]
    fn test_torchvision_import_rejects_incomplete_checkpoint() {
        let device = Default::default();
        let config = tiny();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("partial.safetensors");

        let state: Vec<StateTensor> = torchvision_state(&config.init::<TestBackend>(&device), &config)
            .into_iter()
            .filter(|t| !t.key.starts_with("layer4."))
            .collect();
        write_safetensors(&path, &state);

        let result = config
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &config, &device);
        assert!(matches!(result, Err(FogError::Model(_))));
    }

    #[test]
    fn test_torchvision_key_remapper_block_indices() {
        let remapper = torchvision_key_remapper(&BackboneConfig::new()).unwrap();
        // conv1, bn1, 16 blocks, two shortcut rules, two batch-norm renames
        assert_eq!(remapper.patterns.len(), 2 + 16 + 2 + 2);

        let apply = |key: &str| {
            remapper.patterns.iter().fold(key.to_string(), |key, (pattern, to)| {
                pattern.replace_all(&key, to.as_str()).to_string()
            })
        };
        assert_eq!(apply("bn1.running_mean"), "stem.bn.running_mean");
        assert_eq!(apply("bn1.weight"), "stem.bn.gamma");
        assert_eq!(apply("layer1.2.bn1.weight"), "blocks.2.bn1.gamma");
        assert_eq!(apply("layer3.0.downsample.0.weight"), "blocks.7.downsample.conv.weight");
        assert_eq!(apply("layer3.0.downsample.1.bias"), "blocks.7.downsample.bn.beta");
        assert_eq!(apply("layer4.2.conv3.weight"), "blocks.15.conv3.weight");
        assert_eq!(apply("fc.weight"), "fc.weight");
    }
}
