#![allow(unsafe_code)]
//! 共享内存区域适配器
//!
//! 区域对外只暴露一段 `AtomicU32` 字；标志字用 Release/Acquire 访问，
//! 数据字以 `f32` 位模式存放。
//!
//! - [`HeapRegion`]: 进程内区域（测试与仿真试验端），可附带中断线
//! - [`MmapRegion`]: `memmap2` 映射的设备文件或 `/dev/shm` 文件

use crate::TransportError;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// 两端可见的共享字区域
pub trait SharedRegion: Send + Sync {
    fn words(&self) -> &[AtomicU32];

    /// 写入标志后通知对端（无中断硬件时为空操作）
    fn raise(&self) {}

    fn word(&self, index: usize) -> Result<&AtomicU32, TransportError> {
        let len = self.words().len();
        self.words().get(index).ok_or_else(|| {
            TransportError::Region(format!("word {} outside region of {} words", index, len))
        })
    }

    fn load(&self, index: usize) -> Result<u32, TransportError> {
        Ok(self.word(index)?.load(Ordering::Acquire))
    }

    fn store(&self, index: usize, value: u32) -> Result<(), TransportError> {
        self.word(index)?.store(value, Ordering::Release);
        Ok(())
    }

    fn load_f32(&self, index: usize) -> Result<f32, TransportError> {
        Ok(f32::from_bits(self.load(index)?))
    }

    fn store_f32(&self, index: usize, value: f32) -> Result<(), TransportError> {
        self.store(index, value.to_bits())
    }

    /// 检查区域覆盖 `[0, end_word)`
    fn ensure_len(&self, end_word: usize) -> Result<(), TransportError> {
        let len = self.words().len();
        if len < end_word {
            return Err(TransportError::Region(format!(
                "region has {} words, layout needs {}",
                len, end_word
            )));
        }
        Ok(())
    }
}

/// 中断线：写端 `raise`，每个订阅者收到一次合并后的唤醒
#[derive(Debug, Default)]
pub struct InterruptLine {
    subscribers: Mutex<Vec<Sender<()>>>,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn raise(&self) {
        // 已有未消费的唤醒时直接合并；断开的订阅者被移除
        self.subscribers
            .lock()
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
    }
}

/// 进程内共享区域
#[derive(Debug)]
pub struct HeapRegion {
    words: Box<[AtomicU32]>,
    line: InterruptLine,
}

impl HeapRegion {
    pub fn new(len_words: usize) -> Self {
        Self {
            words: (0..len_words).map(|_| AtomicU32::new(0)).collect(),
            line: InterruptLine::new(),
        }
    }

    /// 订阅区域的中断线
    pub fn subscribe(&self) -> Receiver<()> {
        self.line.subscribe()
    }
}

impl SharedRegion for HeapRegion {
    fn words(&self) -> &[AtomicU32] {
        &self.words
    }

    fn raise(&self) {
        self.line.raise();
    }
}

/// 内存映射区域
pub struct MmapRegion {
    /// 保持映射存活；只通过 `words` 访问
    _mmap: MmapMut,
    /// SAFETY: 指向映射起始处，映射存活期间有效
    ptr: NonNull<AtomicU32>,
    len: usize,
}

// SAFETY: MmapRegion owns its mapping and only hands out `&[AtomicU32]`; every access
// goes through atomic operations.
unsafe impl Send for MmapRegion {}

// SAFETY: Shared access is limited to atomic loads and stores on the mapped words.
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// 映射 `path`；普通文件不足 `min_bytes` 时扩展
    pub fn open(path: impl AsRef<Path>, min_bytes: usize) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                TransportError::Region(format!("Cannot open {}: {}", path.display(), e))
            })?;
        let meta = file.metadata()?;
        if meta.is_file() && meta.len() < min_bytes as u64 {
            file.set_len(min_bytes as u64)?;
        }

        // SAFETY: The file is opened read/write and stays mapped for the lifetime of
        // MmapRegion. Concurrent writers in other processes only touch it through
        // aligned 4-byte words, which we access atomically.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| {
            TransportError::Region(format!("Cannot map {}: {}", path.display(), e))
        })?;
        if mmap.len() < min_bytes {
            return Err(TransportError::Region(format!(
                "{} maps {} bytes, need {}",
                path.display(),
                mmap.len(),
                min_bytes
            )));
        }

        let ptr = NonNull::new(mmap.as_mut_ptr().cast::<AtomicU32>())
            .ok_or_else(|| TransportError::Region("null mapping".into()))?;
        if ptr.as_ptr().align_offset(std::mem::align_of::<AtomicU32>()) != 0 {
            return Err(TransportError::Region("mapping is not word aligned".into()));
        }
        let len = mmap.len() / std::mem::size_of::<AtomicU32>();
        debug!("Mapped {} ({} words)", path.display(), len);

        Ok(Self {
            _mmap: mmap,
            ptr,
            len,
        })
    }
}

impl SharedRegion for MmapRegion {
    fn words(&self) -> &[AtomicU32] {
        // SAFETY: ptr is aligned, points to `len` initialised u32 words inside the
        // mapping, and the mapping lives as long as self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}
