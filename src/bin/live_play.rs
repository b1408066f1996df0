use anyhow::{anyhow, Result};
use live_pull_player::{
    CpalAudioSink, FrameSink, LiveStreamPlayer, PlayerSinks, PlayerStats, StatsSink, StatusSink,
    VideoFrame,
};
use log::info;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 终端拉流验证工具：播放指定 URL，状态与统计打印到控制台
struct ConsoleSink {
    frame_count: AtomicU64,
}

impl FrameSink for ConsoleSink {
    fn on_frame(&self, frame: VideoFrame) {
        let count = self.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == 1 {
            info!("🎬 首帧到达: {}x{}", frame.width, frame.height);
        }
    }
}

impl StatusSink for ConsoleSink {
    fn on_status(&self, text: &str) {
        println!("[状态] {}", text);
    }
    fn on_error(&self, message: &str) {
        eprintln!("[错误] {}", message);
    }
}

impl StatsSink for ConsoleSink {
    fn on_stats(&self, stats: PlayerStats) {
        info!(
            "队列 视频:{} 音频:{} | 码率 {:.1} kbps | 抖动 {:.1} ms | 丢包 {}",
            stats.video_queue_size,
            stats.audio_queue_size,
            stats.incoming_bitrate_kbps,
            stats.jitter_buffer_ms,
            stats.dropped_video_packets
        );
    }
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = env::args().skip(1);
    let url = args
        .next()
        .ok_or_else(|| anyhow!("用法: live_play <url> [播放秒数]"))?;
    let seconds: u64 = args
        .next()
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(30);

    let sink = Arc::new(ConsoleSink {
        frame_count: AtomicU64::new(0),
    });
    let player = LiveStreamPlayer::new(PlayerSinks {
        frame: sink.clone(),
        status: sink.clone(),
        stats: sink.clone(),
        audio: Arc::new(CpalAudioSink::new()),
    });

    info!("🚀 开始拉流: {} ({}s)", url, seconds);
    player.start(&url)?;
    std::thread::sleep(Duration::from_secs(seconds));

    player.stop();
    player.wait_for_stop();
    info!("✅ 结束，共收到 {} 帧", sink.frame_count.load(Ordering::Relaxed));
    Ok(())
}
