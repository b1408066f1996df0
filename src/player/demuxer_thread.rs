use crate::core::Result;
use crate::player::input_stream::{InputFactory, InputStream, PacketKind};
use crate::player::manager::{store_f64, update_stats, OwnerHandle, Shared, StreamSession};
use crate::player::sink::{AudioSink, StatusSink};
use log::{debug, info, warn};
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

/// 重连等待的分片长度，保证 stop 请求能被及时观察到
const RECONNECT_SLEEP_SLICE_MS: u64 = 50;

/// 码率统计窗口
const BITRATE_WINDOW_MS: u64 = 1000;

/// 解封装主循环（在独立线程中运行）
///
/// 外层是重连控制：打开失败与播放中断走同一套重试预算；
/// 内层逐包读取并按流类型路由到对应队列。用户 stop 通过
/// running/stop_requested 标志与队列关闭协作退出，绝不在这里 join。
pub(crate) fn demux_loop(
    url: String,
    shared: Arc<Shared>,
    factory: Arc<dyn InputFactory>,
    owner: OwnerHandle,
) {
    info!("{} 🎬 解封装线程启动: {}", log_ctx(), url);

    let mut retry_count: u32 = 0;

    while shared.interrupt.running.load(Ordering::Acquire) {
        let mut input = match open_session(&url, &shared, factory.as_ref(), &owner) {
            Ok(input) => input,
            Err(e) => {
                warn!("{} ❌ 打开流失败: {}", log_ctx(), e);
                shared.sinks.status.on_error(&e.to_string());

                if shared.interrupt.interrupted() {
                    break;
                }

                let max_retries = shared.max_reconnect_attempts.load(Ordering::Acquire);
                if retry_count >= max_retries {
                    shared
                        .sinks
                        .status
                        .on_error(&format!("Failed to connect after {} attempts.", max_retries));
                    shared.sinks.status.on_status("Stopped");
                    // 重试预算耗尽：清掉运行标志并关闭队列，唤醒阻塞在 pop 上的
                    // 解码线程，令各线程自然退出
                    shared.interrupt.running.store(false, Ordering::Release);
                    shared.interrupt.stop_requested.store(true, Ordering::Release);
                    shared.video_queue.close();
                    shared.audio_queue.close();
                    break;
                }

                retry_count += 1;
                shared.sinks.status.on_status(&format!(
                    "Retrying connection ({}/{})",
                    retry_count, max_retries
                ));
                sleep_reconnect_delay(&shared);
                continue;
            }
        };

        shared.sinks.status.on_status("Playing");
        // 成功打开后清零失败计数
        retry_count = 0;

        read_until_disconnect(input.as_mut(), &shared);
        drop(input);

        if shared.interrupt.interrupted() {
            break;
        }

        // 连接中断：关闭并清空队列，释放本次会话的解码资源
        shared.video_queue.close();
        shared.audio_queue.close();
        shared.video_queue.clear();
        shared.audio_queue.clear();
        close_session(&shared);

        let max_retries = shared.max_reconnect_attempts.load(Ordering::Acquire);
        if retry_count >= max_retries {
            shared.sinks.status.on_error(&format!(
                "Connection lost. Reached maximum {} retries.",
                max_retries
            ));
            shared.sinks.status.on_status("Stopped");
            shared.interrupt.running.store(false, Ordering::Release);
            shared.interrupt.stop_requested.store(true, Ordering::Release);
            break;
        }

        retry_count += 1;
        shared.video_queue.open();
        shared.audio_queue.open();
        shared.sinks.status.on_status(&format!(
            "Retrying connection ({}/{})",
            retry_count, max_retries
        ));
        sleep_reconnect_delay(&shared);
    }

    close_session(&shared);
    info!("{} 🛑 解封装线程退出", log_ctx());
}

/// 内层读包循环：正常返回即连接中断（用户停止时直接返回）
fn read_until_disconnect(input: &mut dyn InputStream, shared: &Shared) {
    let mut window_start = Instant::now();
    let mut bytes_accumulated: u64 = 0;

    while shared.interrupt.running.load(Ordering::Acquire) {
        match input.read_packet() {
            Ok(media) => {
                bytes_accumulated += media.packet.size() as u64;

                let pushed = match media.kind {
                    PacketKind::Video => {
                        shared.video_queue.push(media, &shared.interrupt.running)
                    }
                    PacketKind::Audio => {
                        shared.audio_queue.push(media, &shared.interrupt.running)
                    }
                };

                if !pushed {
                    // 队列已关闭（停止或收尾窗口）：包已释放，稍候再读
                    if !shared.interrupt.running.load(Ordering::Acquire) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
            Err(e) => {
                if !shared.interrupt.running.load(Ordering::Acquire) {
                    break;
                }
                debug!("{} 读取数据包失败: {}", log_ctx(), e);
                shared.sinks.status.on_status("Connection lost");
                break;
            }
        }

        // 约每 1 秒快照一次入流码率
        if window_start.elapsed() >= Duration::from_millis(BITRATE_WINDOW_MS) {
            let kbps = bytes_accumulated as f64 * 8.0 / 1000.0;
            store_f64(&shared.bitrate_kbps, kbps);
            bytes_accumulated = 0;
            window_start = Instant::now();
            update_stats(shared);
        }
    }
}

/// 打开输入并装配本次连接的解码会话
///
/// 视频解码器是必需的；音频走「协商设备格式 → 创建解码器」两步，
/// 任何一步失败都整体放弃音频资源，仅保留视频。
fn open_session(
    url: &str,
    shared: &Shared,
    factory: &dyn InputFactory,
    owner: &OwnerHandle,
) -> Result<Box<dyn InputStream>> {
    close_session(shared);

    let mut input = factory.open(url, shared.interrupt.clone())?;

    let video_decoder = input.create_video_decoder()?;

    let mut audio_decoder = None;
    let mut audio_frame_duration_ms = 0.0;
    match input.audio_source_format() {
        Some((source_rate, source_channels)) => {
            // 设备协商必须在 owner 线程上执行（音频 API 绑定线程）
            let negotiated = owner.invoke({
                let sink = shared.sinks.audio.clone();
                move || sink.configure(source_rate, source_channels)
            });

            match negotiated {
                Some(Ok((rate, channels))) if rate > 0 && channels > 0 => {
                    shared.target_sample_rate.store(rate, Ordering::Release);
                    shared.target_channels.store(channels as u32, Ordering::Release);

                    match input.create_audio_decoder(rate, channels) {
                        Ok(decoder) => {
                            info!(
                                "{} 🔊 音频输出协商完成: {} Hz, {} 声道",
                                log_ctx(),
                                rate,
                                channels
                            );
                            audio_frame_duration_ms = input.audio_frame_duration_ms();
                            audio_decoder = Some(decoder);
                        }
                        Err(e) => {
                            warn!("{} ⚠️ 音频解码器初始化失败，仅播放视频: {}", log_ctx(), e);
                            shared.sinks.status.on_error(&e.to_string());
                            teardown_audio(shared, owner);
                        }
                    }
                }
                Some(Ok(_)) => {
                    warn!("{} ⚠️ 音频设备返回无效配置，仅播放视频", log_ctx());
                    teardown_audio(shared, owner);
                }
                Some(Err(e)) => {
                    warn!("{} ⚠️ 音频输出初始化失败，仅播放视频: {}", log_ctx(), e);
                    shared.sinks.status.on_error(&e.to_string());
                    teardown_audio(shared, owner);
                }
                None => {
                    // owner 线程不可用（关闭中），按无音频继续
                    teardown_audio(shared, owner);
                }
            }
        }
        None => {
            // 源不含音频流
            teardown_audio(shared, owner);
        }
    }

    store_f64(&shared.video_frame_ms, input.video_frame_duration_ms());
    store_f64(&shared.audio_frame_ms, audio_frame_duration_ms);

    *shared.session.lock().unwrap() = Some(StreamSession {
        video: video_decoder,
        audio: audio_decoder,
    });

    Ok(input)
}

/// 在 Context Mutex 保护下释放本次连接的解码器/转换器资源
pub(crate) fn close_session(shared: &Shared) {
    shared.session.lock().unwrap().take();
    store_f64(&shared.video_frame_ms, 0.0);
    store_f64(&shared.audio_frame_ms, 0.0);
}

fn teardown_audio(shared: &Shared, owner: &OwnerHandle) {
    let sink = shared.sinks.audio.clone();
    owner.invoke(move || sink.teardown());
    shared.target_sample_rate.store(0, Ordering::Release);
    shared.target_channels.store(0, Ordering::Release);
}

/// 分片睡眠重连间隔，期间持续观察停止请求
fn sleep_reconnect_delay(shared: &Shared) {
    let delay_ms = shared.reconnect_delay_ms.load(Ordering::Acquire);
    if delay_ms == 0 {
        return;
    }

    let deadline = Instant::now() + Duration::from_millis(delay_ms);
    loop {
        if shared.interrupt.interrupted() {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(Duration::from_millis(RECONNECT_SLEEP_SLICE_MS)));
    }
}
