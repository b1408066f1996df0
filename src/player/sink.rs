use crate::core::{PlayerStats, Result, VideoFrame};
use std::sync::Arc;

/// 视频帧接收端
///
/// 回调必须快速返回（渲染端自行排队），解码线程不会等待绘制。
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: VideoFrame);
}

/// 状态与错误文本接收端
///
/// on_status 的取值固定为 "Connecting" / "Playing" / "Connection lost" /
/// "Retrying connection (k/N)" / "Stopped"；on_error 不蕴含停止语义。
pub trait StatusSink: Send + Sync {
    fn on_status(&self, text: &str);
    fn on_error(&self, message: &str);
}

/// 统计快照接收端（约 2.5 Hz，另在关键状态变化时推送）
pub trait StatsSink: Send + Sync {
    fn on_stats(&self, stats: PlayerStats);
}

/// 音频输出设备抽象
///
/// 接收协商后采样率/声道数的交错 16 位小端 PCM。configure / write /
/// teardown 只会在 owner 调度线程上被调用（宿主音频 API 往往绑定线程）。
pub trait AudioSink: Send + Sync {
    /// 协商输出格式：返回与请求最接近的设备支持格式
    fn configure(&self, sample_rate: u32, channels: u16) -> Result<(u32, u16)>;

    /// 当前还能接收多少字节
    fn bytes_free(&self) -> usize;

    /// 写入 PCM 数据，返回实际接收的字节数（可能小于 data.len()）
    fn write(&self, data: &[u8]) -> usize;

    /// 释放设备资源；未配置时应当是无害的空操作
    fn teardown(&self);
}

/// 播放器对外回调的汇总
pub struct PlayerSinks {
    pub frame: Arc<dyn FrameSink>,
    pub status: Arc<dyn StatusSink>,
    pub stats: Arc<dyn StatsSink>,
    pub audio: Arc<dyn AudioSink>,
}
