use serde::{Deserialize, Serialize};

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    BGRA,
    RGBA,
}

/// 解码后的视频帧数据
///
/// 交错 32 位颜色，每通道 8 位，行距 = width * 4，原点在左上角。
/// 尺寸与源流一致，所有权随 FrameSink 回调转移给渲染端。
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,      // CPU 内存数据
}

/// 播放器统计快照
///
/// 每个统计定时器周期（约 400ms）重算一次，关键状态变化时也会额外推送。
/// jitter_buffer_ms 取视频/音频两侧抖动缓冲估算的较大值。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStats {
    /// 视频数据包队列深度
    pub video_queue_size: usize,

    /// 音频数据包队列深度
    pub audio_queue_size: usize,

    /// 入流码率（kbps，按约 1 秒的滑动窗口统计）
    pub incoming_bitrate_kbps: f64,

    /// 抖动缓冲占用估算（毫秒）
    pub jitter_buffer_ms: f64,

    /// 自本次 start 以来累计丢弃的视频包数
    pub dropped_video_packets: u64,
}
