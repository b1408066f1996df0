use crate::core::{PlayerError, PlayerStats, Result};
use crate::player::decoder::{AudioDecode, VideoDecode};
use crate::player::demuxer_thread::{close_session, demux_loop};
use crate::player::input_stream::{
    sanitize_input_url, FfmpegInputFactory, InputFactory, InterruptFlags, MediaPacket,
};
use crate::player::packet_queue::{OverflowPolicy, PacketQueue};
use crate::player::sink::{AudioSink, FrameSink, PlayerSinks, StatsSink, StatusSink};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use log::{error, info};
use std::collections::VecDeque;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

const QUEUE_MAX_PACKETS_VIDEO: usize = 90;
const QUEUE_MAX_PACKETS_AUDIO: usize = 180;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
const STATS_INTERVAL_MS: u64 = 400;
const AUDIO_PUMP_INTERVAL_MS: u64 = 20;

/// f64 以位模式存进 AtomicU64（码率、帧时长等统计字段）
pub(crate) fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Release);
}

pub(crate) fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Acquire))
}

/// 本次连接的解码会话：视频必有，音频可选
///
/// 整个会话只由 Context Mutex（Shared::session）保护，重连时在锁内
/// 整体替换，解码器/缩放/重采样资源随 drop 一并释放。
pub(crate) struct StreamSession {
    pub(crate) video: Box<dyn VideoDecode>,
    pub(crate) audio: Option<Box<dyn AudioDecode>>,
}

#[derive(Default)]
struct WorkerThreads {
    demux: Option<JoinHandle<()>>,
    video: Option<JoinHandle<()>>,
    audio: Option<JoinHandle<()>>,
}

impl WorkerThreads {
    fn is_empty(&self) -> bool {
        self.demux.is_none() && self.video.is_none() && self.audio.is_none()
    }
}

/// 各线程共享的播放器状态
pub(crate) struct Shared {
    pub(crate) interrupt: Arc<InterruptFlags>,
    pub(crate) video_queue: PacketQueue<MediaPacket>,
    pub(crate) audio_queue: PacketQueue<MediaPacket>,
    /// Context Mutex：解码器与转换器只在这把锁下使用和销毁
    pub(crate) session: Mutex<Option<StreamSession>>,
    /// 待写入音频 sink 的 PCM 缓冲（音频泵每 tick 排空一截）
    pub(crate) pending_audio: Mutex<VecDeque<Vec<u8>>>,
    pub(crate) bitrate_kbps: AtomicU64,
    pub(crate) video_frame_ms: AtomicU64,
    pub(crate) audio_frame_ms: AtomicU64,
    pub(crate) target_sample_rate: AtomicU32,
    pub(crate) target_channels: AtomicU32,
    pub(crate) max_reconnect_attempts: AtomicU32,
    pub(crate) reconnect_delay_ms: AtomicU64,
    /// stop 的单一入口闸：CAS 成功者负责启动收尾
    stop_in_progress: AtomicBool,
    workers: Mutex<WorkerThreads>,
    /// 收尾任务句柄，任何需要等待 stop 完成的线程从这里取
    finalizer: Mutex<Option<JoinHandle<()>>>,
    pub(crate) sinks: PlayerSinks,
}

enum OwnerCommand {
    Invoke(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// owner 调度线程的句柄
///
/// 音频设备的建立/拆除对线程有亲和性，工作线程通过 invoke 把调用
/// 阻塞式投递到 owner 线程串行执行。
#[derive(Clone)]
pub(crate) struct OwnerHandle {
    tx: Sender<OwnerCommand>,
}

impl OwnerHandle {
    /// 在 owner 线程上执行闭包并等待返回值；owner 已退出时返回 None
    pub(crate) fn invoke<R, F>(&self, job: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        let boxed: Box<dyn FnOnce() + Send> = Box::new(move || {
            let _ = done_tx.send(job());
        });
        if self.tx.send(OwnerCommand::Invoke(boxed)).is_err() {
            return None;
        }
        done_rx.recv().ok()
    }
}

/// 拉流直播播放器 - 对外的唯一门面
///
/// 负责三个工作线程（解封装 / 视频解码 / 音频解码）的生命周期、
/// 两个定时器（统计 ~400ms、音频泵 ~20ms，跑在内部 owner 线程上）、
/// 以及异步化的 stop 收尾。所有解码结果经由构造时注入的 sink 流出。
pub struct LiveStreamPlayer {
    shared: Arc<Shared>,
    factory: Arc<dyn InputFactory>,
    owner: OwnerHandle,
    owner_thread: Option<JoinHandle<()>>,
}

impl LiveStreamPlayer {
    /// 使用 FFmpeg 输入层创建播放器
    pub fn new(sinks: PlayerSinks) -> Self {
        Self::with_input_factory(sinks, Arc::new(FfmpegInputFactory))
    }

    /// 注入自定义输入源创建播放器（测试与特殊输入场景）
    pub fn with_input_factory(sinks: PlayerSinks, factory: Arc<dyn InputFactory>) -> Self {
        let shared = Arc::new(Shared {
            interrupt: Arc::new(InterruptFlags::default()),
            video_queue: PacketQueue::new(QUEUE_MAX_PACKETS_VIDEO, OverflowPolicy::DropOldest),
            audio_queue: PacketQueue::new(QUEUE_MAX_PACKETS_AUDIO, OverflowPolicy::Block),
            session: Mutex::new(None),
            pending_audio: Mutex::new(VecDeque::new()),
            bitrate_kbps: AtomicU64::new(0),
            video_frame_ms: AtomicU64::new(0),
            audio_frame_ms: AtomicU64::new(0),
            target_sample_rate: AtomicU32::new(0),
            target_channels: AtomicU32::new(0),
            max_reconnect_attempts: AtomicU32::new(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            reconnect_delay_ms: AtomicU64::new(DEFAULT_RECONNECT_DELAY_MS),
            stop_in_progress: AtomicBool::new(false),
            workers: Mutex::new(WorkerThreads::default()),
            finalizer: Mutex::new(None),
            sinks,
        });

        let (owner_tx, owner_rx) = unbounded();
        let owner = OwnerHandle { tx: owner_tx };
        let owner_shared = shared.clone();
        let owner_thread = thread::spawn(move || owner_loop(owner_shared, owner_rx));

        info!("{} 🎮 播放器创建完成", log_ctx());
        Self {
            shared,
            factory,
            owner,
            owner_thread: Some(owner_thread),
        }
    }

    /// 开始拉流
    ///
    /// 空 URL 直接拒绝，不产生任何副作用；已有会话会先被停掉并等待
    /// 收尾完成，然后清空队列、复位标志并拉起三个工作线程。
    pub fn start(&self, url: &str) -> Result<()> {
        if url.trim().is_empty() {
            return Err(PlayerError::ConfigError("Stream URL is empty.".to_string()));
        }

        self.stop();
        self.wait_for_stop();

        let url = sanitize_input_url(url.trim());
        info!("{} 🚀 启动拉流: {}", log_ctx(), url);

        self.shared.video_queue.clear();
        self.shared.audio_queue.clear();
        self.shared.video_queue.open();
        self.shared.audio_queue.open();
        self.shared.video_queue.reset_dropped_count();

        self.shared.interrupt.stop_requested.store(false, Ordering::Release);
        self.shared.interrupt.running.store(true, Ordering::Release);
        store_f64(&self.shared.bitrate_kbps, 0.0);
        store_f64(&self.shared.video_frame_ms, 0.0);
        store_f64(&self.shared.audio_frame_ms, 0.0);

        self.shared.sinks.status.on_status("Connecting");
        update_stats(&self.shared);

        let mut workers = self.shared.workers.lock().unwrap();
        workers.demux = Some(thread::spawn({
            let shared = self.shared.clone();
            let factory = self.factory.clone();
            let owner = self.owner.clone();
            move || demux_loop(url, shared, factory, owner)
        }));
        workers.video = Some(thread::spawn({
            let shared = self.shared.clone();
            move || video_decode_loop(shared)
        }));
        workers.audio = Some(thread::spawn({
            let shared = self.shared.clone();
            move || audio_decode_loop(shared)
        }));

        Ok(())
    }

    /// 停止播放（幂等、不阻塞调用线程）
    ///
    /// 真正的收尾（join 三个工作线程、排空队列、拆音频设备）由后台
    /// 任务完成；并发 stop 通过 stop_in_progress 上的 CAS 串行化，
    /// 只有赢家会启动收尾任务。
    pub fn stop(&self) {
        // 快速路径：没有会话在运行、也没有待回收的线程
        {
            let workers = self.shared.workers.lock().unwrap();
            if !self.shared.interrupt.running.load(Ordering::Acquire)
                && workers.is_empty()
                && !self.shared.stop_in_progress.load(Ordering::Acquire)
            {
                return;
            }
        }

        if self
            .shared
            .stop_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // 已有一次收尾在进行中
            return;
        }

        info!("{} ⏹️ 停止播放（异步收尾启动）", log_ctx());
        let shared = self.shared.clone();
        let owner = self.owner.clone();
        let handle = thread::spawn(move || shutdown(shared, owner));
        *self.shared.finalizer.lock().unwrap() = Some(handle);
    }

    /// 等待进行中的 stop 收尾结束；没有收尾在跑时立即返回
    pub fn wait_for_stop(&self) {
        loop {
            let handle = self.shared.finalizer.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            if !self.shared.stop_in_progress.load(Ordering::Acquire) {
                return;
            }
            // 收尾任务刚被另一个线程启动、句柄尚未入槽
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.interrupt.running.load(Ordering::Acquire)
    }

    /// 设置重连尝试上限（负数按 0 处理，0 表示不重试）
    pub fn set_max_reconnect_attempts(&self, attempts: i32) {
        self.shared
            .max_reconnect_attempts
            .store(attempts.max(0) as u32, Ordering::Release);
    }

    /// 设置重连间隔毫秒数（负数按 0 处理）
    pub fn set_reconnect_delay_ms(&self, delay_ms: i64) {
        self.shared
            .reconnect_delay_ms
            .store(delay_ms.max(0) as u64, Ordering::Release);
    }
}

impl Drop for LiveStreamPlayer {
    fn drop(&mut self) {
        self.stop();
        self.wait_for_stop();
        let _ = self.owner.tx.send(OwnerCommand::Shutdown);
        if let Some(handle) = self.owner_thread.take() {
            let _ = handle.join();
        }
    }
}

/// 后台收尾：只由 stop 的 CAS 赢家启动
fn shutdown(shared: Arc<Shared>, owner: OwnerHandle) {
    shared.interrupt.running.store(false, Ordering::Release);
    shared.interrupt.stop_requested.store(true, Ordering::Release);

    shared.video_queue.close();
    shared.audio_queue.close();

    let (demux, video, audio) = {
        let mut workers = shared.workers.lock().unwrap();
        (workers.demux.take(), workers.video.take(), workers.audio.take())
    };
    if let Some(handle) = demux {
        let _ = handle.join();
        info!("{} ✅ 解封装线程已结束", log_ctx());
    }
    if let Some(handle) = video {
        let _ = handle.join();
        info!("{} ✅ 视频解码线程已结束", log_ctx());
    }
    if let Some(handle) = audio {
        let _ = handle.join();
        info!("{} ✅ 音频解码线程已结束", log_ctx());
    }

    shared.video_queue.clear();
    shared.audio_queue.clear();
    close_session(&shared);
    shared.pending_audio.lock().unwrap().clear();
    store_f64(&shared.bitrate_kbps, 0.0);

    update_stats(&shared);

    // 音频设备拆除必须回到 owner 线程执行
    let sink = shared.sinks.audio.clone();
    owner.invoke(move || sink.teardown());
    shared.target_sample_rate.store(0, Ordering::Release);
    shared.target_channels.store(0, Ordering::Release);

    shared.sinks.status.on_status("Stopped");
    shared.stop_in_progress.store(false, Ordering::Release);
    info!("{} ✅ 停止播放完成，所有线程已清理", log_ctx());
}

/// owner 调度线程：两个定时器加一个阻塞式命令入口
fn owner_loop(shared: Arc<Shared>, rx: Receiver<OwnerCommand>) {
    let stats_tick = tick(Duration::from_millis(STATS_INTERVAL_MS));
    let pump_tick = tick(Duration::from_millis(AUDIO_PUMP_INTERVAL_MS));

    loop {
        select! {
            recv(rx) -> command => match command {
                Ok(OwnerCommand::Invoke(job)) => job(),
                Ok(OwnerCommand::Shutdown) | Err(_) => break,
            },
            recv(stats_tick) -> _ => {
                if shared.interrupt.running.load(Ordering::Acquire) {
                    update_stats(&shared);
                }
            },
            recv(pump_tick) -> _ => {
                if shared.interrupt.running.load(Ordering::Acquire) {
                    pump_pending_audio(&shared);
                }
            },
        }
    }
}

/// 音频泵：每 tick 把待写队列尽量写进 sink
///
/// sink 一次可能只吃下一部分，剩余字节放回队首保持顺序。
fn pump_pending_audio(shared: &Shared) {
    let sink = &shared.sinks.audio;
    let mut pending = shared.pending_audio.lock().unwrap();

    while let Some(mut buffer) = pending.pop_front() {
        if sink.bytes_free() == 0 {
            pending.push_front(buffer);
            break;
        }

        let written = sink.write(&buffer);
        if written == 0 {
            pending.push_front(buffer);
            break;
        }
        if written < buffer.len() {
            buffer.drain(..written);
            pending.push_front(buffer);
            break;
        }
    }
}

/// 构建统计快照并推送给 StatsSink
pub(crate) fn update_stats(shared: &Shared) {
    let video_queue_size = shared.video_queue.size();
    let audio_queue_size = shared.audio_queue.size();

    let jitter_video = load_f64(&shared.video_frame_ms) * video_queue_size as f64;
    let jitter_audio = load_f64(&shared.audio_frame_ms) * audio_queue_size as f64;

    shared.sinks.stats.on_stats(PlayerStats {
        video_queue_size,
        audio_queue_size,
        incoming_bitrate_kbps: load_f64(&shared.bitrate_kbps),
        jitter_buffer_ms: jitter_video.max(jitter_audio),
        dropped_video_packets: shared.video_queue.dropped_count(),
    });
}

/// 视频解码线程：排空视频队列，帧交给 FrameSink
fn video_decode_loop(shared: Arc<Shared>) {
    info!("{} 🎬 视频解码线程启动", log_ctx());

    while shared.interrupt.running.load(Ordering::Acquire) {
        let Some(media) = shared.video_queue.pop(&shared.interrupt.running) else {
            if !shared.interrupt.running.load(Ordering::Acquire) {
                break;
            }
            // 队列处于重连收尾的关闭窗口，稍候再试
            thread::sleep(Duration::from_millis(5));
            continue;
        };

        let frame = {
            let mut session = shared.session.lock().unwrap();
            let Some(session) = session.as_mut() else {
                // 重连间隙没有解码器，丢弃该包
                continue;
            };
            match session.video.decode(&media) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("{} ❌ 视频解码失败: {}", log_ctx(), e);
                    shared.sinks.status.on_error("Error while decoding video frame.");
                    None
                }
            }
        };

        // 在锁外交付，渲染端不会反压解码
        if let Some(frame) = frame {
            shared.sinks.frame.on_frame(frame);
        }
    }

    info!("{} 🎬 视频解码线程结束", log_ctx());
}

/// 音频解码线程：解码重采样后的 PCM 进待写队列，由音频泵消费
fn audio_decode_loop(shared: Arc<Shared>) {
    info!("{} 🔊 音频解码线程启动", log_ctx());

    while shared.interrupt.running.load(Ordering::Acquire) {
        let Some(media) = shared.audio_queue.pop(&shared.interrupt.running) else {
            if !shared.interrupt.running.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
            continue;
        };

        let buffers = {
            let mut session = shared.session.lock().unwrap();
            let Some(session) = session.as_mut() else {
                continue;
            };
            let Some(audio) = session.audio.as_mut() else {
                continue;
            };
            match audio.decode(&media) {
                Ok(buffers) => buffers,
                Err(e) => {
                    error!("{} ❌ 音频解码失败: {}", log_ctx(), e);
                    shared.sinks.status.on_error("Error while decoding audio frame.");
                    Vec::new()
                }
            }
        };

        if !buffers.is_empty() {
            let mut pending = shared.pending_audio.lock().unwrap();
            pending.extend(buffers);
        }
    }

    info!("{} 🔊 音频解码线程结束", log_ctx());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PixelFormat, VideoFrame};
    use crate::player::decoder::{AudioDecode, VideoDecode};
    use crate::player::input_stream::{InputStream, PacketKind};
    use crate::player::sink::{AudioSink, FrameSink, StatsSink, StatusSink};
    use ffmpeg_next as ffmpeg;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    // ==================== 采集型 sink ====================

    #[derive(Default)]
    struct RecordingFrameSink {
        frames: Mutex<Vec<VideoFrame>>,
    }

    impl FrameSink for RecordingFrameSink {
        fn on_frame(&self, frame: VideoFrame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    impl RecordingFrameSink {
        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    #[derive(Default)]
    struct RecordingStatusSink {
        statuses: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl StatusSink for RecordingStatusSink {
        fn on_status(&self, text: &str) {
            self.statuses.lock().unwrap().push(text.to_string());
        }
        fn on_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }

    impl RecordingStatusSink {
        fn statuses(&self) -> Vec<String> {
            self.statuses.lock().unwrap().clone()
        }
        fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct RecordingStatsSink {
        snapshots: Mutex<Vec<PlayerStats>>,
    }

    impl StatsSink for RecordingStatsSink {
        fn on_stats(&self, stats: PlayerStats) {
            self.snapshots.lock().unwrap().push(stats);
        }
    }

    impl RecordingStatsSink {
        fn count(&self) -> usize {
            self.snapshots.lock().unwrap().len()
        }
        fn last(&self) -> Option<PlayerStats> {
            self.snapshots.lock().unwrap().last().cloned()
        }
        fn max_video_queue_size(&self) -> usize {
            self.snapshots
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.video_queue_size)
                .max()
                .unwrap_or(0)
        }
    }

    #[derive(Default)]
    struct RecordingAudioSink {
        configured: Mutex<Option<(u32, u16)>>,
        bytes_written: AtomicUsize,
        torn_down: AtomicBool,
    }

    impl AudioSink for RecordingAudioSink {
        fn configure(&self, sample_rate: u32, channels: u16) -> Result<(u32, u16)> {
            *self.configured.lock().unwrap() = Some((sample_rate, channels));
            self.torn_down.store(false, Ordering::SeqCst);
            Ok((sample_rate, channels))
        }
        fn bytes_free(&self) -> usize {
            64 * 1024
        }
        fn write(&self, data: &[u8]) -> usize {
            self.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
            data.len()
        }
        fn teardown(&self) {
            self.torn_down.store(true, Ordering::SeqCst);
        }
    }

    // ==================== 脚本化 mock 输入 ====================

    #[derive(Clone, Copy)]
    enum AfterScript {
        /// 包耗尽后返回读错误（触发 Connection lost）
        ReadError,
        /// 包耗尽后阻塞，直到停止请求
        Block,
    }

    #[derive(Clone, Copy)]
    enum OpenPlan {
        /// 打开失败
        Fail,
        /// 打开阻塞到被中断标志打断（模拟无响应的对端）
        BlockUntilInterrupt,
        /// 正常产出脚本化的包序列
        Stream {
            video_packets: usize,
            audio_packets: usize,
            read_interval_ms: u64,
            video_decode_delay_ms: u64,
            after: AfterScript,
        },
    }

    struct ScriptedFactory {
        plans: Vec<OpenPlan>,
        next: AtomicUsize,
    }

    impl ScriptedFactory {
        fn new(plans: Vec<OpenPlan>) -> Arc<Self> {
            Arc::new(Self {
                plans,
                next: AtomicUsize::new(0),
            })
        }
        fn open_count(&self) -> usize {
            self.next.load(Ordering::SeqCst)
        }
    }

    impl InputFactory for ScriptedFactory {
        fn open(&self, _url: &str, interrupt: Arc<InterruptFlags>) -> Result<Box<dyn InputStream>> {
            // 超出脚本长度后重复最后一个计划
            let index = self
                .next
                .fetch_add(1, Ordering::SeqCst)
                .min(self.plans.len() - 1);

            match self.plans[index] {
                OpenPlan::Fail => Err(PlayerError::OpenError("mock open failure".to_string())),
                OpenPlan::BlockUntilInterrupt => {
                    let deadline = Instant::now() + Duration::from_secs(2);
                    while Instant::now() < deadline {
                        if interrupt.interrupted() {
                            return Err(PlayerError::OpenError("open interrupted".to_string()));
                        }
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(PlayerError::OpenError("mock open timeout".to_string()))
                }
                OpenPlan::Stream {
                    video_packets,
                    audio_packets,
                    read_interval_ms,
                    video_decode_delay_ms,
                    after,
                } => Ok(Box::new(ScriptedInput {
                    video_left: video_packets,
                    audio_left: audio_packets,
                    has_audio: audio_packets > 0,
                    read_interval: Duration::from_millis(read_interval_ms),
                    video_decode_delay: Duration::from_millis(video_decode_delay_ms),
                    after,
                    interrupt,
                    toggle: false,
                })),
            }
        }
    }

    struct ScriptedInput {
        video_left: usize,
        audio_left: usize,
        has_audio: bool,
        read_interval: Duration,
        video_decode_delay: Duration,
        after: AfterScript,
        interrupt: Arc<InterruptFlags>,
        toggle: bool,
    }

    fn mock_packet(kind: PacketKind, size: usize) -> MediaPacket {
        let stream_index = match kind {
            PacketKind::Video => 0,
            PacketKind::Audio => 1,
        };
        MediaPacket {
            packet: ffmpeg::Packet::new(size),
            kind,
            stream_index,
        }
    }

    impl InputStream for ScriptedInput {
        fn read_packet(&mut self) -> Result<MediaPacket> {
            if !self.read_interval.is_zero() {
                thread::sleep(self.read_interval);
            }

            if self.video_left == 0 && self.audio_left == 0 {
                match self.after {
                    AfterScript::ReadError => {
                        return Err(PlayerError::NetworkError("mock read error".to_string()))
                    }
                    AfterScript::Block => {
                        while !self.interrupt.interrupted() {
                            thread::sleep(Duration::from_millis(2));
                        }
                        return Err(PlayerError::NetworkError("read interrupted".to_string()));
                    }
                }
            }

            // 视频/音频交替产出，一方耗尽后只出另一方
            let emit_video = if self.video_left > 0 && self.audio_left > 0 {
                self.toggle = !self.toggle;
                self.toggle
            } else {
                self.video_left > 0
            };

            if emit_video {
                self.video_left -= 1;
                Ok(mock_packet(PacketKind::Video, 1200))
            } else {
                self.audio_left -= 1;
                Ok(mock_packet(PacketKind::Audio, 400))
            }
        }

        fn video_frame_duration_ms(&self) -> f64 {
            1000.0 / 30.0
        }

        fn audio_frame_duration_ms(&self) -> f64 {
            1000.0 * 1024.0 / 48000.0
        }

        fn audio_source_format(&self) -> Option<(u32, u16)> {
            if self.has_audio {
                Some((48000, 2))
            } else {
                None
            }
        }

        fn create_video_decoder(&mut self) -> Result<Box<dyn VideoDecode>> {
            Ok(Box::new(MockVideoDecoder {
                delay: self.video_decode_delay,
            }))
        }

        fn create_audio_decoder(
            &mut self,
            _sample_rate: u32,
            _channels: u16,
        ) -> Result<Box<dyn AudioDecode>> {
            Ok(Box::new(MockAudioDecoder))
        }
    }

    struct MockVideoDecoder {
        delay: Duration,
    }

    impl VideoDecode for MockVideoDecoder {
        fn decode(&mut self, _packet: &MediaPacket) -> Result<Option<VideoFrame>> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            Ok(Some(VideoFrame {
                width: 2,
                height: 2,
                format: PixelFormat::BGRA,
                data: vec![0u8; 16],
            }))
        }
    }

    struct MockAudioDecoder;

    impl AudioDecode for MockAudioDecoder {
        fn decode(&mut self, _packet: &MediaPacket) -> Result<Vec<Vec<u8>>> {
            Ok(vec![vec![0u8; 256]])
        }
    }

    // ==================== 测试装置 ====================

    struct TestHarness {
        player: LiveStreamPlayer,
        frames: Arc<RecordingFrameSink>,
        status: Arc<RecordingStatusSink>,
        stats: Arc<RecordingStatsSink>,
        audio: Arc<RecordingAudioSink>,
    }

    fn make_player(factory: Arc<ScriptedFactory>) -> TestHarness {
        let frames = Arc::new(RecordingFrameSink::default());
        let status = Arc::new(RecordingStatusSink::default());
        let stats = Arc::new(RecordingStatsSink::default());
        let audio = Arc::new(RecordingAudioSink::default());

        let sinks = PlayerSinks {
            frame: frames.clone(),
            status: status.clone(),
            stats: stats.clone(),
            audio: audio.clone(),
        };
        let player = LiveStreamPlayer::with_input_factory(sinks, factory);

        TestHarness {
            player,
            frames,
            status,
            stats,
            audio,
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    // ==================== 端到端场景 ====================

    #[test]
    fn test_happy_path_delivers_frames_audio_and_stats() {
        let factory = ScriptedFactory::new(vec![OpenPlan::Stream {
            video_packets: 100,
            audio_packets: 200,
            read_interval_ms: 5,
            video_decode_delay_ms: 0,
            after: AfterScript::Block,
        }]);
        let h = make_player(factory);

        h.player.start("rtsp://mock/stream").unwrap();

        assert!(wait_until(Duration::from_secs(4), || h.frames.count() >= 90));
        assert!(wait_until(Duration::from_secs(2), || {
            h.audio.bytes_written.load(Ordering::SeqCst) > 0
        }));
        // 统计至少 2 Hz
        assert!(wait_until(Duration::from_secs(2), || h.stats.count() >= 4));
        assert!(wait_until(Duration::from_secs(2), || {
            h.stats
                .last()
                .map(|s| s.incoming_bitrate_kbps > 0.0)
                .unwrap_or(false)
        }));
        assert_eq!(*h.audio.configured.lock().unwrap(), Some((48000, 2)));

        h.player.stop();
        h.player.wait_for_stop();
        assert!(!h.player.is_running());
    }

    #[test]
    fn test_video_burst_drops_oldest_and_bounds_queue() {
        let factory = ScriptedFactory::new(vec![OpenPlan::Stream {
            video_packets: 600,
            audio_packets: 0,
            read_interval_ms: 0,
            video_decode_delay_ms: 20,
            after: AfterScript::Block,
        }]);
        let h = make_player(factory);

        h.player.start("rtsp://mock/burst").unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            h.stats
                .last()
                .map(|s| s.dropped_video_packets >= 410)
                .unwrap_or(false)
        }));
        // 队列深度从不超过容量
        assert!(h.stats.max_video_queue_size() <= QUEUE_MAX_PACKETS_VIDEO);
        // 无音频流：不应有任何音频字节流出
        assert_eq!(h.audio.bytes_written.load(Ordering::SeqCst), 0);

        h.player.stop();
        h.player.wait_for_stop();
    }

    #[test]
    fn test_reconnects_after_connection_lost() {
        let factory = ScriptedFactory::new(vec![
            OpenPlan::Stream {
                video_packets: 50,
                audio_packets: 0,
                read_interval_ms: 1,
                video_decode_delay_ms: 0,
                after: AfterScript::ReadError,
            },
            OpenPlan::Stream {
                video_packets: 50,
                audio_packets: 0,
                read_interval_ms: 1,
                video_decode_delay_ms: 0,
                after: AfterScript::Block,
            },
        ]);
        let h = make_player(factory);
        h.player.set_max_reconnect_attempts(3);
        h.player.set_reconnect_delay_ms(50);

        h.player.start("rtmp://mock/live").unwrap();

        assert!(wait_until(Duration::from_secs(4), || {
            h.status.statuses().iter().filter(|s| *s == "Playing").count() >= 2
        }));

        let statuses = h.status.statuses();
        let expected = [
            "Connecting",
            "Playing",
            "Connection lost",
            "Retrying connection (1/3)",
            "Playing",
        ];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(statuses[i], *want, "状态序列第 {} 项不符: {:?}", i, statuses);
        }

        // 恢复后继续正常交付
        assert!(wait_until(Duration::from_secs(2), || h.frames.count() >= 60));

        h.player.stop();
        h.player.wait_for_stop();
    }

    #[test]
    fn test_retry_budget_exhaustion_is_terminal() {
        let factory = ScriptedFactory::new(vec![OpenPlan::Fail]);
        let h = make_player(factory.clone());
        h.player.set_max_reconnect_attempts(2);
        h.player.set_reconnect_delay_ms(10);

        h.player.start("rtsp://mock/unreachable").unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            h.status.statuses().iter().any(|s| s == "Stopped")
        }));

        let statuses = h.status.statuses();
        let retries: Vec<&String> = statuses
            .iter()
            .filter(|s| s.starts_with("Retrying connection"))
            .collect();
        assert_eq!(retries.len(), 2, "应恰好两次重试播报: {:?}", statuses);
        assert_eq!(retries[0], "Retrying connection (1/2)");
        assert_eq!(retries[1], "Retrying connection (2/2)");
        assert!(h
            .status
            .errors()
            .iter()
            .any(|e| e.contains("after 2 attempts")));
        assert!(!h.player.is_running());
        assert_eq!(factory.open_count(), 3);

        // 预算耗尽后两个队列都已关闭，解码线程不会滞留在 pop 上
        assert!(wait_until(Duration::from_millis(500), || {
            !h.player.shared.video_queue.is_open() && !h.player.shared.audio_queue.is_open()
        }));

        h.player.stop();
        h.player.wait_for_stop();
    }

    #[test]
    fn test_stop_interrupts_blocking_open() {
        let factory = ScriptedFactory::new(vec![OpenPlan::BlockUntilInterrupt]);
        let h = make_player(factory);

        h.player.start("rtsp://mock/slow").unwrap();
        thread::sleep(Duration::from_millis(20));

        let begun = Instant::now();
        h.player.stop();
        h.player.wait_for_stop();

        assert!(
            begun.elapsed() < Duration::from_millis(200),
            "stop 收尾耗时 {:?}",
            begun.elapsed()
        );
        assert!(!h.player.is_running());
        assert_eq!(h.frames.count(), 0);
        assert!(h.status.statuses().iter().any(|s| s == "Stopped"));
    }

    #[test]
    fn test_source_without_audio_plays_video_only() {
        let factory = ScriptedFactory::new(vec![OpenPlan::Stream {
            video_packets: 30,
            audio_packets: 0,
            read_interval_ms: 1,
            video_decode_delay_ms: 0,
            after: AfterScript::Block,
        }]);
        let h = make_player(factory);

        h.player.start("rtsp://mock/video-only").unwrap();

        assert!(wait_until(Duration::from_secs(2), || h.frames.count() >= 20));
        assert!(h.audio.torn_down.load(Ordering::SeqCst));
        assert_eq!(h.audio.bytes_written.load(Ordering::SeqCst), 0);
        assert!(wait_until(Duration::from_secs(1), || {
            h.stats
                .last()
                .map(|s| s.audio_queue_size == 0)
                .unwrap_or(false)
        }));

        h.player.stop();
        h.player.wait_for_stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_restart_works() {
        let factory = ScriptedFactory::new(vec![OpenPlan::Stream {
            video_packets: 50,
            audio_packets: 0,
            read_interval_ms: 1,
            video_decode_delay_ms: 0,
            after: AfterScript::Block,
        }]);
        let h = make_player(factory);

        h.player.start("rtsp://mock/a").unwrap();
        assert!(wait_until(Duration::from_secs(2), || h.frames.count() >= 10));

        h.player.stop();
        h.player.stop();
        h.player.stop();
        h.player.wait_for_stop();
        assert!(!h.player.is_running());

        // 重新 start 等价于全新会话
        let frames_after_stop = h.frames.count();
        h.player.start("rtsp://mock/a").unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            h.frames.count() >= frames_after_stop + 10
        }));
        // 丢包计数从零开始
        assert!(wait_until(Duration::from_secs(1), || {
            h.stats
                .last()
                .map(|s| s.dropped_video_packets == 0)
                .unwrap_or(false)
        }));

        h.player.stop();
        h.player.wait_for_stop();
        assert!(!h.player.is_running());
    }

    #[test]
    fn test_empty_url_is_rejected_without_side_effects() {
        let factory = ScriptedFactory::new(vec![OpenPlan::Fail]);
        let h = make_player(factory.clone());

        assert!(matches!(
            h.player.start(""),
            Err(PlayerError::ConfigError(_))
        ));
        assert!(!h.player.is_running());
        assert_eq!(factory.open_count(), 0);
        assert!(h.status.statuses().is_empty());
    }
}
