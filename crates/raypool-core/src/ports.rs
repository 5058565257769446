use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// 探测用本地端口分配器
///
/// 从起始端口开始向上分配，已分给其他探测任务的端口会被跳过；
/// 端口被外部程序占用时由调用方继续申请下一个。
#[derive(Debug, Clone)]
pub struct PortAllocator {
    inner: Arc<Mutex<PortState>>,
}

#[derive(Debug)]
struct PortState {
    base: u16,
    cursor: u16,
    leased: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PortState {
                base,
                cursor: base,
                leased: HashSet::new(),
            })),
        }
    }

    /// 申请一个端口。`after` 为上一次冲突的端口，从它之后继续查找。
    pub fn acquire(&self, after: Option<u16>) -> Option<u16> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let span = u32::from(u16::MAX - state.base) + 1;
        let mut candidate = match after {
            Some(port) => state.next_after(port),
            None => state.cursor,
        };
        for _ in 0..span {
            if !state.leased.contains(&candidate) {
                state.leased.insert(candidate);
                state.cursor = state.next_after(candidate);
                return Some(candidate);
            }
            candidate = state.next_after(candidate);
        }
        None
    }

    /// 归还端口
    pub fn release(&self, port: u16) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.leased.remove(&port);
    }

    pub fn leased(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).leased.len()
    }
}

impl PortState {
    fn next_after(&self, port: u16) -> u16 {
        if port == u16::MAX || port < self.base {
            self.base
        } else {
            port + 1
        }
    }
}
