use crate::core::{PlayerError, Result};
use crate::player::sink::AudioSink;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};

/// 输出缓冲上限：约 0.2 秒的采样数（rate * channels / 5）
fn buffer_capacity_samples(config: &StreamConfig) -> usize {
    (config.sample_rate.0 as usize * config.channels as usize) / 5
}

/// 默认音频输出 - 使用 cpal 播放协商后的 S16 交错 PCM
///
/// bytes_free / write 实现按字节的部分写入语义：写不下的部分由
/// 播放器的音频泵放回待写队列，顺序不会打乱。
pub struct CpalAudioSink {
    active: Mutex<Option<ActiveOutput>>,
}

struct ActiveOutput {
    // 持有流保持播放；析构即停止
    _stream: Stream,
    buffer: Arc<SegQueue<i16>>,
    capacity_samples: usize,
}

// cpal::Stream 本身不是 Send，但本 sink 的 configure/write/teardown 只会
// 在播放器的 owner 调度线程上串行调用，不会跨线程并发使用流对象
unsafe impl Send for CpalAudioSink {}
unsafe impl Sync for CpalAudioSink {}

impl CpalAudioSink {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
        }
    }

    /// 检查配置是否兼容（要求设备支持 S16 输出）
    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        let channels_match = config.channels == supported.channels();
        let format_match = supported.sample_format() == cpal::SampleFormat::I16;

        rate_in_range && channels_match && format_match
    }

    /// 就近协商输出配置
    ///
    /// 顺序：原样支持 → 采样率夹到支持区间（声道数不变）→ 标准配置回退表。
    fn negotiate(device: &Device, sample_rate: u32, channels: u16) -> Result<StreamConfig> {
        let supported: Vec<SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?
            .collect();

        let wanted = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        if supported
            .iter()
            .any(|range| Self::is_config_compatible(&wanted, range))
        {
            return Ok(wanted);
        }

        // 采样率就近夹取，声道数保持源配置
        for range in &supported {
            if range.channels() == channels && range.sample_format() == cpal::SampleFormat::I16 {
                let clamped =
                    sample_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
                warn!("音频设备不支持 {} Hz，就近调整为 {} Hz", sample_rate, clamped);
                return Ok(StreamConfig {
                    channels,
                    sample_rate: SampleRate(clamped),
                    buffer_size: cpal::BufferSize::Default,
                });
            }
        }

        // 标准配置回退表
        let fallback_configs = [(48000u32, 2u16), (44100, 2), (48000, 1), (44100, 1)];
        for (fb_rate, fb_channels) in fallback_configs {
            let fb_config = StreamConfig {
                channels: fb_channels,
                sample_rate: SampleRate(fb_rate),
                buffer_size: cpal::BufferSize::Default,
            };
            if supported
                .iter()
                .any(|range| Self::is_config_compatible(&fb_config, range))
            {
                warn!(
                    "⚠️ 音频设备不支持 {} Hz / {} 声道，回退到 {} Hz / {} 声道",
                    sample_rate, channels, fb_rate, fb_channels
                );
                return Ok(fb_config);
            }
        }

        Err(PlayerError::AudioError(format!(
            "音频设备不支持任何可用配置 (原请求: {} Hz, {} 声道)",
            sample_rate, channels
        )))
    }
}

impl Default for CpalAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CpalAudioSink {
    fn configure(&self, sample_rate: u32, channels: u16) -> Result<(u32, u16)> {
        if sample_rate == 0 || channels == 0 {
            return Err(PlayerError::AudioError(format!(
                "请求的音频格式无效: {} Hz, {} 声道",
                sample_rate, channels
            )));
        }

        let mut active = self.active.lock().unwrap();
        // 重连可能重新协商：先释放旧输出
        active.take();

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = Self::negotiate(&device, sample_rate, channels)?;

        let buffer: Arc<SegQueue<i16>> = Arc::new(SegQueue::new());
        let callback_buffer = buffer.clone();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = callback_buffer.pop().unwrap_or(0);
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

        let capacity_samples = buffer_capacity_samples(&config);
        let negotiated = (config.sample_rate.0, config.channels);
        *active = Some(ActiveOutput {
            _stream: stream,
            buffer,
            capacity_samples,
        });

        info!("🔊 音频输出已启动: {} Hz, {} 声道", negotiated.0, negotiated.1);
        Ok(negotiated)
    }

    fn bytes_free(&self) -> usize {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(output) => {
                output
                    .capacity_samples
                    .saturating_sub(output.buffer.len())
                    * 2
            }
            None => 0,
        }
    }

    fn write(&self, data: &[u8]) -> usize {
        let active = self.active.lock().unwrap();
        let Some(output) = active.as_ref() else {
            return 0;
        };

        let free_samples = output.capacity_samples.saturating_sub(output.buffer.len());
        let samples = (data.len() / 2).min(free_samples);
        for chunk in data[..samples * 2].chunks_exact(2) {
            output.buffer.push(i16::from_le_bytes([chunk[0], chunk[1]]));
        }
        samples * 2
    }

    fn teardown(&self) {
        let mut active = self.active.lock().unwrap();
        if active.take().is_some() {
            info!("音频输出已停止");
        }
    }
}
