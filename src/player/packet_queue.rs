use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// 队列满时的溢出策略
///
/// 视频队列用 DropOldest：宁可丢帧也要保住低延迟；
/// 音频队列用 Block：声音必须连续，必要时让解封装线程短暂等待。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// 等待消费端腾出空间（或队列关闭 / 播放器停止）
    Block,
    /// 丢弃最旧的包并计数，然后入队
    DropOldest,
}

/// 线程安全的有界数据包队列，兼任解封装与解码之间的抖动缓冲
///
/// 一把锁加两个条件变量（not_empty / not_full），push/pop 都以调用方的
/// running 标志作为第三个唤醒条件，保证停止请求能立即打断阻塞等待。
pub struct PacketQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    policy: OverflowPolicy,
}

struct Inner<T> {
    queue: VecDeque<T>,
    max_size: usize,
    closed: bool,
    dropped: u64,
}

impl<T> PacketQueue<T> {
    pub fn new(max_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                max_size,
                closed: false,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            policy,
        }
    }

    /// 入队一个数据包
    ///
    /// Block 策略下等待到有空位、队列关闭或 running 变为 false；
    /// DropOldest 策略下先丢弃最旧的包腾位，从不阻塞。
    /// 队列已关闭或播放器不在运行时返回 false，包被就地释放。
    pub fn push(&self, packet: T, running: &AtomicBool) -> bool {
        let mut inner = self.inner.lock();

        match self.policy {
            OverflowPolicy::Block => {
                self.not_full.wait_while(&mut inner, |inner| {
                    !inner.closed
                        && inner.queue.len() >= inner.max_size
                        && running.load(Ordering::Acquire)
                });
                if inner.closed || !running.load(Ordering::Acquire) {
                    return false;
                }
            }
            OverflowPolicy::DropOldest => {
                if inner.closed || !running.load(Ordering::Acquire) {
                    return false;
                }
                while inner.queue.len() >= inner.max_size {
                    inner.queue.pop_front();
                    inner.dropped += 1;
                }
            }
        }

        inner.queue.push_back(packet);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// 出队一个数据包
    ///
    /// 等待到队列非空、队列关闭或 running 变为 false。关闭后仍会把
    /// 剩余的包排空，之后返回 None。
    pub fn pop(&self, running: &AtomicBool) -> Option<T> {
        let mut inner = self.inner.lock();
        self.not_empty.wait_while(&mut inner, |inner| {
            inner.queue.is_empty() && !inner.closed && running.load(Ordering::Acquire)
        });

        let packet = inner.queue.pop_front();
        drop(inner);
        if packet.is_some() {
            self.not_full.notify_one();
        }
        packet
    }

    /// 释放所有缓冲的包并唤醒等待者
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        drop(inner);
        self.not_full.notify_all();
    }

    /// 关闭队列：后续 push 失败，阻塞中的 push/pop 全部被唤醒
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// 重新打开队列，允许 push
    ///
    /// 上一轮连接残留的包一并释放，close();open() 之后队列必为空，
    /// 容量和策略保持不变。
    pub fn open(&self) {
        {
            let mut inner = self.inner.lock();
            inner.queue.clear();
            inner.closed = false;
        }
        self.not_full.notify_all();
    }

    /// 调整容量；DropOldest 策略下立即从队首裁掉超出的部分
    pub fn set_max_size(&self, max_size: usize) {
        let mut inner = self.inner.lock();
        inner.max_size = max_size;
        if self.policy == OverflowPolicy::DropOldest {
            while inner.queue.len() > inner.max_size {
                inner.queue.pop_front();
                inner.dropped += 1;
            }
        }
        drop(inner);
        self.not_full.notify_all();
    }

    pub fn size(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_open(&self) -> bool {
        !self.inner.lock().closed
    }

    /// 因溢出策略被丢弃的包累计数（自上次 reset 起单调递增）
    pub fn dropped_count(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn reset_dropped_count(&self) {
        self.inner.lock().dropped = 0;
    }
}
