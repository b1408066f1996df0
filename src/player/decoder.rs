use crate::core::{PixelFormat, PlayerError, Result, VideoFrame};
use crate::player::input_stream::MediaPacket;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::{codec, ffi, software, util};
use log::{debug, warn};

/// 视频解码抽象：一个包最多产出一帧已转换的 BGRA 图像
///
/// 解码器内部缓冲的多余帧会在后续包的 receive 中陆续吐出，
/// 这样每次迭代的工作量有上界，符合低延迟预期。
pub trait VideoDecode: Send {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Option<VideoFrame>>;
}

/// 音频解码抽象：一个包产出零或多段协商格式的 S16 交错 PCM
pub trait AudioDecode: Send {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<Vec<u8>>>;
}

/// FFmpeg 软件视频解码器 + BGRA 缩放转换
pub struct FfmpegVideoDecoder {
    decoder: codec::decoder::Video,
    scaler: software::scaling::Context,
    width: u32,
    height: u32,
}

// SwsContext 本身不是 Send，但解码器实例只会在单个解码线程中使用
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    /// 从 codec parameters 创建解码器；scaler 随会话一起建好，
    /// 失败即本次连接失败
    pub fn from_parameters(parameters: codec::Parameters) -> Result<Self> {
        let context = codec::context::Context::from_parameters(parameters)?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| PlayerError::CodecSetupError(format!("无法打开视频解码器: {}", e)))?;

        let width = decoder.width();
        let height = decoder.height();

        let scaler = software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            util::format::Pixel::BGRA,
            width,
            height,
            software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| PlayerError::CodecSetupError(format!("无法创建缩放上下文: {}", e)))?;

        debug!(
            "视频解码器: {}x{}, 源格式: {:?} → BGRA",
            width,
            height,
            decoder.format()
        );

        Ok(Self {
            decoder,
            scaler,
            width,
            height,
        })
    }

    /// 把解码帧转为连续内存的 BGRA 图像（行距按 width*4 收紧）
    fn convert_frame(&mut self, frame: &util::frame::Video) -> Result<VideoFrame> {
        let mut converted = util::frame::Video::empty();
        self.scaler
            .run(frame, &mut converted)
            .map_err(|e| PlayerError::DecodeError(format!("视频帧转换失败: {}", e)))?;

        let width = self.width as usize;
        let height = self.height as usize;
        let row_size = width * 4;
        let mut data = vec![0u8; row_size * height];

        let stride = converted.stride(0);
        let frame_data = converted.data(0);
        for y in 0..height {
            let src_offset = y * stride;
            let dst_offset = y * row_size;
            data[dst_offset..dst_offset + row_size]
                .copy_from_slice(&frame_data[src_offset..src_offset + row_size]);
        }

        Ok(VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::BGRA,
            data,
        })
    }
}

impl VideoDecode for FfmpegVideoDecoder {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Option<VideoFrame>> {
        match self.decoder.send_packet(&packet.packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                debug!("视频解码器收到 EOF（send_packet），执行 flush 并忽略本次包");
                self.decoder.flush();
                return Ok(None);
            }
            Err(e) => {
                // 网络流中坏包不致命，跳过即可
                warn!("视频包提交失败（已跳过）: {}", e);
                return Ok(None);
            }
        }

        let mut decoded = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {
                // 每个包只发布第一帧，余下的缓冲帧在后续迭代取出
                self.convert_frame(&decoded).map(Some)
            }
            Err(ffmpeg::Error::Other { errno: 11 }) => Ok(None), // EAGAIN
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(PlayerError::DecodeError(format!("视频解码失败: {}", e))),
        }
    }
}

/// FFmpeg 音频解码器 + 重采样到协商输出格式
pub struct FfmpegAudioDecoder {
    decoder: codec::decoder::Audio,
    resampler: software::resampling::Context,
    target_channels: u16,
}

// SwrContext 同样不是 Send，约束与视频解码器一致
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    /// 创建解码器并按 (target_sample_rate, target_channels) 建好重采样器
    ///
    /// 重采样器初始化失败属于音频建立失败，由上层整体放弃音频。
    pub fn from_parameters(
        parameters: codec::Parameters,
        target_sample_rate: u32,
        target_channels: u16,
    ) -> Result<Self> {
        // codec parameters 在转交给解码器上下文前先记下它携带的声道布局
        let parameters_layout = parameters_channel_layout(&parameters);

        let context = codec::context::Context::from_parameters(parameters)?;
        let decoder = context
            .decoder()
            .audio()
            .map_err(|e| PlayerError::AudioError(format!("无法打开音频解码器: {}", e)))?;

        // 输入声道布局回退链：解码器上下文 → codec parameters → 按声道数的默认布局
        let input_layout = if !decoder.channel_layout().is_empty() {
            decoder.channel_layout()
        } else if let Some(layout) = parameters_layout {
            layout
        } else {
            default_channel_layout(decoder.channels())
        };
        let output_layout = default_channel_layout(target_channels);

        debug!(
            "音频解码器: {} Hz / {} 声道 → {} Hz / {} 声道 (S16)",
            decoder.rate(),
            decoder.channels(),
            target_sample_rate,
            target_channels
        );

        let resampler = software::resampling::Context::get(
            decoder.format(),
            input_layout,
            decoder.rate(),
            util::format::Sample::I16(util::format::sample::Type::Packed),
            output_layout,
            target_sample_rate,
        )
        .map_err(|e| PlayerError::AudioError(format!("无法初始化重采样器: {}", e)))?;

        Ok(Self {
            decoder,
            resampler,
            target_channels,
        })
    }
}

impl AudioDecode for FfmpegAudioDecoder {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<Vec<u8>>> {
        match self.decoder.send_packet(&packet.packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                debug!("音频解码器收到 EOF（send_packet），执行 flush 并忽略本次包");
                self.decoder.flush();
                return Ok(Vec::new());
            }
            Err(e) => {
                warn!("音频包提交失败（已跳过）: {}", e);
                return Ok(Vec::new());
            }
        }

        let mut buffers = Vec::new();
        loop {
            let mut decoded = util::frame::Audio::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let mut resampled = util::frame::Audio::empty();
                    self.resampler
                        .run(&decoded, &mut resampled)
                        .map_err(|e| {
                            PlayerError::DecodeError(format!("音频重采样失败: {}", e))
                        })?;

                    let samples = resampled.samples();
                    if samples == 0 {
                        continue;
                    }

                    // S16 交错：每采样点 channels * 2 字节
                    let byte_len = samples * self.target_channels as usize * 2;
                    buffers.push(resampled.data(0)[..byte_len].to_vec());
                }
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    return Err(PlayerError::DecodeError(format!("音频解码失败: {}", e)))
                }
            }
        }

        Ok(buffers)
    }
}

/// 读取 codec parameters 自带的声道布局（回退链的中间项）
///
/// 只有 native 顺序的布局能映射成掩码；其余情况返回 None，交给
/// 按声道数的默认布局兜底。
fn parameters_channel_layout(parameters: &codec::Parameters) -> Option<ChannelLayout> {
    unsafe {
        let layout = &(*parameters.as_ptr()).ch_layout;
        if layout.order != ffi::AVChannelOrder::AV_CHANNEL_ORDER_NATIVE
            || layout.nb_channels <= 0
        {
            return None;
        }
        let mask = layout.u.mask;
        if mask == 0 {
            return None;
        }
        Some(ChannelLayout::from_bits_truncate(mask))
    }
}

/// 按声道数取默认布局
fn default_channel_layout(channels: u16) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::MONO,
        2 => ChannelLayout::STEREO,
        6 => ChannelLayout::_5POINT1,
        _ => ChannelLayout::STEREO,
    }
}
