use crate::core::{PlayerError, Result};
use crate::player::decoder::{
    AudioDecode, FfmpegAudioDecoder, FfmpegVideoDecoder, VideoDecode,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use log::{debug, info, warn};
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

/// 解封装 I/O 超时（微秒），防止对端静默时线程被永久卡住
const DEMUX_TIMEOUT_US: i64 = 5_000_000;

/// 协作式中断标志
///
/// 播放器持有并更新这两个标志；FFmpeg 的 AVIO interrupt callback 以及
/// 任何自定义输入源在阻塞的网络操作中轮询它们，从而让 stop 请求能
/// 立即打断 open/read。
#[derive(Debug, Default)]
pub struct InterruptFlags {
    pub running: AtomicBool,
    pub stop_requested: AtomicBool,
}

impl InterruptFlags {
    pub fn interrupted(&self) -> bool {
        !self.running.load(Ordering::Acquire) || self.stop_requested.load(Ordering::Acquire)
    }
}

/// Packet 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Video,
    Audio,
}

/// 媒体包（可跨线程传递）
///
/// 内部的 ffmpeg Packet 自带引用计数缓冲，push 进队列即转移所有权。
pub struct MediaPacket {
    pub packet: ffmpeg::Packet,
    pub kind: PacketKind,
    pub stream_index: usize,
}

// 实现 Send，允许跨线程传递
unsafe impl Send for MediaPacket {}

/// 输入流抽象接口
///
/// 封装一次成功打开的连接：逐包读取、流参数查询、按会话创建解码器。
/// 不同来源（FFmpeg 网络流、测试用脚本源等）都实现这个接口。
pub trait InputStream: Send {
    /// 读取下一个属于所选视频/音频流的包；其他流的包被直接丢弃。
    /// 任何失败（含 EOF）都视为连接中断，由上层走重连路径。
    fn read_packet(&mut self) -> Result<MediaPacket>;

    /// 视频帧时长（毫秒），用于抖动缓冲估算
    fn video_frame_duration_ms(&self) -> f64;

    /// 音频帧时长（毫秒）；无音频流时无意义，返回 0
    fn audio_frame_duration_ms(&self) -> f64;

    /// 音频源的原生 (采样率, 声道数)；源不含音频流时返回 None
    fn audio_source_format(&self) -> Option<(u32, u16)>;

    /// 创建本次连接的视频解码器（含到 BGRA 的缩放转换）
    fn create_video_decoder(&mut self) -> Result<Box<dyn VideoDecode>>;

    /// 创建本次连接的音频解码器，输出重采样为协商格式的 S16 交错 PCM
    fn create_audio_decoder(&mut self, sample_rate: u32, channels: u16)
        -> Result<Box<dyn AudioDecode>>;
}

/// 输入源工厂：重连循环每次尝试都通过它重新 open
pub trait InputFactory: Send + Sync {
    fn open(&self, url: &str, interrupt: Arc<InterruptFlags>) -> Result<Box<dyn InputStream>>;
}

/// 默认工厂：用 FFmpeg 打开网络流
pub struct FfmpegInputFactory;

impl InputFactory for FfmpegInputFactory {
    fn open(&self, url: &str, interrupt: Arc<InterruptFlags>) -> Result<Box<dyn InputStream>> {
        FfmpegInput::open(url, interrupt).map(|input| Box::new(input) as Box<dyn InputStream>)
    }
}

static FFMPEG_INIT: Once = Once::new();

fn ensure_ffmpeg_init() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg 初始化失败: {}", e);
        }
        ffmpeg::format::network::init();
    });
}

/// AVIO 中断回调：running 为 false 或收到 stop 请求时返回 1，
/// 让 FFmpeg 内部阻塞的网络调用立即以错误返回
unsafe extern "C" fn input_interrupt_callback(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    let flags = &*(opaque as *const InterruptFlags);
    if flags.interrupted() {
        1
    } else {
        0
    }
}

/// FFmpeg 输入流适配器
///
/// format context 通过 ffi 打开：安全封装无法在 avformat_open_input
/// 之前安装 interrupt callback。codec parameters 深拷贝为自有副本，
/// 解码器一律走安全 API 创建。
pub struct FfmpegInput {
    ctx: *mut ffi::AVFormatContext,
    // interrupt callback 的 opaque 指向这份 Arc 的数据，必须保持存活
    interrupt: Arc<InterruptFlags>,
    video_stream_index: usize,
    audio_stream_index: Option<usize>,
    video_par: ffmpeg::codec::Parameters,
    audio_par: Option<ffmpeg::codec::Parameters>,
    video_frame_duration_ms: f64,
    audio_frame_duration_ms: f64,
    audio_source_rate: u32,
    audio_source_channels: u16,
}

// ctx 裸指针只在本结构体内部使用；读包与释放都由持有者串行进行
unsafe impl Send for FfmpegInput {}

fn q2d(q: ffi::AVRational) -> f64 {
    if q.den == 0 {
        0.0
    } else {
        q.num as f64 / q.den as f64
    }
}

unsafe fn dict_set(options: *mut *mut ffi::AVDictionary, key: &str, value: &str) {
    let key = CString::new(key).expect("dict key 不含 NUL");
    let value = CString::new(value).expect("dict value 不含 NUL");
    ffi::av_dict_set(options, key.as_ptr(), value.as_ptr(), 0);
}

unsafe fn stream_at(ctx: *mut ffi::AVFormatContext, index: usize) -> *mut ffi::AVStream {
    *(*ctx).streams.add(index)
}

/// 把流上的 codec parameters 深拷贝为自有副本，生命周期与 format context 解耦
unsafe fn copy_codec_parameters(
    src: *const ffi::AVCodecParameters,
) -> Result<ffmpeg::codec::Parameters> {
    let mut dst = ffi::avcodec_parameters_alloc();
    if dst.is_null() {
        return Err(PlayerError::OpenError("无法分配 codec parameters".to_string()));
    }
    let ret = ffi::avcodec_parameters_copy(dst, src);
    if ret < 0 {
        ffi::avcodec_parameters_free(&mut dst);
        return Err(PlayerError::FFmpegError(ffmpeg::Error::from(ret)));
    }
    Ok(ffmpeg::codec::Parameters::wrap(dst, None))
}

impl FfmpegInput {
    /// 打开 URL 并选定首个视频流 / 首个音频流
    ///
    /// 视频流是必需的；音频流可选。低延迟选项与 RTSP 的 TCP 强制
    /// 传输在这里统一设置。
    pub fn open(url: &str, interrupt: Arc<InterruptFlags>) -> Result<Self> {
        ensure_ffmpeg_init();

        let scheme = url_scheme_lower(url);
        let url_c = CString::new(url)
            .map_err(|_| PlayerError::OpenError("URL 含非法字符".to_string()))?;

        unsafe {
            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(PlayerError::OpenError("无法分配 format context".to_string()));
            }

            (*ctx).flags |= ffi::AVFMT_FLAG_NOBUFFER as c_int;
            (*ctx).interrupt_callback.callback = Some(input_interrupt_callback);
            (*ctx).interrupt_callback.opaque = Arc::as_ptr(&interrupt) as *mut c_void;

            // 低延迟选项：不做输入缓冲 + 读写超时兜底
            let mut options: *mut ffi::AVDictionary = std::ptr::null_mut();
            dict_set(&mut options, "buffer_size", "65536");
            dict_set(&mut options, "fflags", "nobuffer");
            dict_set(&mut options, "flags", "low_delay");
            dict_set(&mut options, "rw_timeout", &DEMUX_TIMEOUT_US.to_string());
            if scheme == "rtsp" {
                // RTSP 强制走 TCP；stimeout 兼容旧版 RTSP 超时处理
                dict_set(&mut options, "rtsp_transport", "tcp");
                dict_set(&mut options, "stimeout", &DEMUX_TIMEOUT_US.to_string());
            }

            let ret = ffi::avformat_open_input(
                &mut ctx,
                url_c.as_ptr(),
                std::ptr::null(),
                &mut options,
            );
            ffi::av_dict_free(&mut options);
            if ret < 0 {
                // 失败时 avformat_open_input 已释放 context
                return Err(PlayerError::OpenError(format!(
                    "Failed to open stream: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            let ret = ffi::avformat_find_stream_info(ctx, std::ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut ctx);
                return Err(PlayerError::OpenError(format!(
                    "Failed to retrieve stream info: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            // 按首次出现选定视频/音频流
            let mut video_stream_index = None;
            let mut audio_stream_index = None;
            for i in 0..(*ctx).nb_streams as usize {
                let stream = stream_at(ctx, i);
                match (*(*stream).codecpar).codec_type {
                    ffi::AVMediaType::AVMEDIA_TYPE_VIDEO if video_stream_index.is_none() => {
                        video_stream_index = Some(i);
                    }
                    ffi::AVMediaType::AVMEDIA_TYPE_AUDIO if audio_stream_index.is_none() => {
                        audio_stream_index = Some(i);
                    }
                    _ => {}
                }
            }

            let video_stream_index = match video_stream_index {
                Some(index) => index,
                None => {
                    ffi::avformat_close_input(&mut ctx);
                    return Err(PlayerError::NoVideoStream);
                }
            };

            debug!("视频流索引: {}", video_stream_index);
            debug!("音频流索引: {:?}", audio_stream_index);

            let video_par = match copy_codec_parameters(
                (*stream_at(ctx, video_stream_index)).codecpar,
            ) {
                Ok(par) => par,
                Err(e) => {
                    ffi::avformat_close_input(&mut ctx);
                    return Err(e);
                }
            };

            // 帧率回退链: avg_frame_rate → r_frame_rate → 1/time_base → 30 fps
            let vstream = stream_at(ctx, video_stream_index);
            let mut fps = q2d((*vstream).avg_frame_rate);
            if fps < 1.0 {
                fps = q2d((*vstream).r_frame_rate);
            }
            if fps < 1.0 && (*vstream).time_base.den != 0 {
                fps = 1.0 / q2d((*vstream).time_base);
            }
            if fps < 1.0 {
                fps = 30.0;
            }
            let video_frame_duration_ms = 1000.0 / fps;

            // 音频源参数探测：借临时解码器读取采样率/声道/帧长
            let mut audio_par = None;
            let mut audio_source_rate = 0u32;
            let mut audio_source_channels = 0u16;
            let mut audio_frame_duration_ms = 0.0;
            if let Some(audio_index) = audio_stream_index {
                match copy_codec_parameters((*stream_at(ctx, audio_index)).codecpar) {
                    Ok(par) => {
                        match ffmpeg::codec::context::Context::from_parameters(par.clone())
                            .and_then(|context| context.decoder().audio())
                        {
                            Ok(decoder) => {
                                audio_source_rate =
                                    if decoder.rate() > 0 { decoder.rate() } else { 48000 };
                                audio_source_channels =
                                    if decoder.channels() > 0 { decoder.channels() } else { 2 };
                                let frame_size = (*decoder.as_ptr()).frame_size;
                                audio_frame_duration_ms = if frame_size > 0 {
                                    1000.0 * frame_size as f64 / audio_source_rate as f64
                                } else {
                                    1000.0 * 1024.0 / audio_source_rate as f64
                                };
                                audio_par = Some(par);
                            }
                            Err(e) => {
                                // 音频参数不可用则按无音频处理，不影响视频
                                warn!("音频流参数探测失败，忽略音频: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("复制音频 codec parameters 失败，忽略音频: {}", e);
                    }
                }
            }

            info!(
                "🌐 流已打开: {} (fps={:.2}, 音频={})",
                url,
                fps,
                if audio_par.is_some() { "有" } else { "无" }
            );

            Ok(Self {
                ctx,
                interrupt,
                video_stream_index,
                audio_stream_index,
                video_par,
                audio_par,
                video_frame_duration_ms,
                audio_frame_duration_ms,
                audio_source_rate,
                audio_source_channels,
            })
        }
    }
}

impl InputStream for FfmpegInput {
    fn read_packet(&mut self) -> Result<MediaPacket> {
        loop {
            // 快速路径：停止请求无需等 FFmpeg 的 interrupt 轮询
            if self.interrupt.interrupted() {
                return Err(PlayerError::NetworkError("读取被停止请求打断".to_string()));
            }

            let mut packet = ffmpeg::Packet::empty();
            let ret = unsafe { ffi::av_read_frame(self.ctx, packet.as_mut_ptr()) };
            if ret < 0 {
                return Err(PlayerError::NetworkError(format!(
                    "读取数据包失败: {}",
                    ffmpeg::Error::from(ret)
                )));
            }

            let stream_index = packet.stream();
            if stream_index == self.video_stream_index {
                return Ok(MediaPacket {
                    packet,
                    kind: PacketKind::Video,
                    stream_index,
                });
            }
            if Some(stream_index) == self.audio_stream_index {
                return Ok(MediaPacket {
                    packet,
                    kind: PacketKind::Audio,
                    stream_index,
                });
            }
            // 其他流的包跳过（packet 在本轮迭代结束时释放）
        }
    }

    fn video_frame_duration_ms(&self) -> f64 {
        self.video_frame_duration_ms
    }

    fn audio_frame_duration_ms(&self) -> f64 {
        self.audio_frame_duration_ms
    }

    fn audio_source_format(&self) -> Option<(u32, u16)> {
        self.audio_par
            .as_ref()
            .map(|_| (self.audio_source_rate, self.audio_source_channels))
    }

    fn create_video_decoder(&mut self) -> Result<Box<dyn VideoDecode>> {
        let decoder = FfmpegVideoDecoder::from_parameters(self.video_par.clone())?;
        Ok(Box::new(decoder))
    }

    fn create_audio_decoder(
        &mut self,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioDecode>> {
        let par = self
            .audio_par
            .clone()
            .ok_or_else(|| PlayerError::AudioError("源不含音频流".to_string()))?;
        let decoder = FfmpegAudioDecoder::from_parameters(par, sample_rate, channels)?;
        Ok(Box::new(decoder))
    }
}

impl Drop for FfmpegInput {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                ffi::avformat_close_input(&mut self.ctx);
            }
        }
    }
}

/// 取 URL 的小写 scheme；没有 scheme 时返回空串
pub fn url_scheme_lower(url: &str) -> String {
    url.split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .unwrap_or_default()
}

/// 播放器是纯客户端：rtmp/tcp URL 上的 listen / listen_timeout
/// 查询参数会让底层库进入监听模式，打开前一律剥掉
pub fn sanitize_input_url(url: &str) -> String {
    let scheme = url_scheme_lower(url);
    if scheme != "rtmp" && scheme != "tcp" {
        return url.to_string();
    }

    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|param| !param.is_empty())
        .filter(|param| {
            let key = param.split('=').next().unwrap_or("");
            key != "listen" && key != "listen_timeout"
        })
        .collect();

    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}
