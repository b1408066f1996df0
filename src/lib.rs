//! 拉流模式直播播放核心
//!
//! 连接 RTSP/RTMP 等直播源，解封装后并发解码音视频：视频帧（BGRA）
//! 经 [`FrameSink`] 交给渲染端，音频（S16 交错 PCM）经 [`AudioSink`]
//! 送入输出设备，网络瞬断通过有限次自动重连恢复。纯客户端，不监听
//! 任何入站连接；GUI 与渲染不在本 crate 范围内。
//!
//! ```no_run
//! use live_pull_player::{CpalAudioSink, LiveStreamPlayer, PlayerSinks};
//! # use live_pull_player::{FrameSink, StatsSink, StatusSink, PlayerStats, VideoFrame};
//! # use std::sync::Arc;
//! # struct Ui;
//! # impl FrameSink for Ui { fn on_frame(&self, _f: VideoFrame) {} }
//! # impl StatusSink for Ui { fn on_status(&self, _t: &str) {} fn on_error(&self, _m: &str) {} }
//! # impl StatsSink for Ui { fn on_stats(&self, _s: PlayerStats) {} }
//! # let ui = Arc::new(Ui);
//! let player = LiveStreamPlayer::new(PlayerSinks {
//!     frame: ui.clone(),
//!     status: ui.clone(),
//!     stats: ui.clone(),
//!     audio: Arc::new(CpalAudioSink::new()),
//! });
//! player.start("rtsp://camera.local/stream")?;
//! # Ok::<(), live_pull_player::PlayerError>(())
//! ```

pub mod core;
pub mod player;

pub use crate::core::{PixelFormat, PlayerError, PlayerStats, Result, VideoFrame};
pub use player::{
    AudioSink, CpalAudioSink, FrameSink, InputFactory, InputStream, LiveStreamPlayer,
    OverflowPolicy, PacketQueue, PlayerSinks, StatsSink, StatusSink,
};
