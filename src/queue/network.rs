use tokio::sync::watch;

/// 网络连通性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// 监听在线/离线切换，调度器订阅后负责暂停和恢复传输
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<Connectivity>,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

impl NetworkMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// 平台层（浏览器 online/offline 事件、系统网络通知）调用
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.tx.send_if_modified(|current| {
            if *current == connectivity {
                return false;
            }
            tracing::info!(?connectivity, "Connectivity changed");
            *current = connectivity;
            true
        });
    }

    pub fn go_offline(&self) {
        self.set_connectivity(Connectivity::Offline);
    }

    pub fn go_online(&self) {
        self.set_connectivity(Connectivity::Online);
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity() == Connectivity::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}
