use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::tunnel::TunnelService;

use super::{dispatch, Request, Response, CODE_BAD_REQUEST, MAX_REQUEST_BYTES};

/// IPC 服务端
pub struct IpcServer {
    #[cfg_attr(not(unix), allow(dead_code))]
    socket_path: PathBuf,
    #[cfg_attr(not(unix), allow(dead_code))]
    socket_mode: u32,
    #[cfg_attr(not(windows), allow(dead_code))]
    pipe_name: String,
    /// 等待客户端请求行的最长时间
    read_timeout: Duration,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, socket_mode: u32) -> Self {
        Self {
            socket_path,
            socket_mode,
            pipe_name: super::PIPE_NAME.to_string(),
            read_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self::new(cfg.socket_path(), cfg.socket_mode_bits()).with_read_timeout(cfg.ipc_timeout())
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_pipe_name(mut self, name: impl Into<String>) -> Self {
        self.pipe_name = name.into();
        self
    }

    /// 接受连接直到 shutdown 触发；每个连接在独立任务中处理
    #[cfg(unix)]
    pub async fn serve(self, service: Arc<TunnelService>, shutdown: CancellationToken) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        use tokio::net::UnixListener;

        // 清理上次异常退出遗留的 socket
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => debug!(path = %self.socket_path.display(), "stale socket removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(self.socket_mode),
        )?;
        info!(
            path = %self.socket_path.display(),
            mode = %format_args!("{:o}", self.socket_mode),
            "ipc server listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = service.clone();
                        let read_timeout = self.read_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &service, read_timeout).await {
                                debug!(error = %e, "ipc connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "ipc accept failed"),
                },
            }
        }

        drop(listener);
        let _ = tokio::fs::remove_file(&self.socket_path).await;
        info!("ipc server stopped");
        Ok(())
    }

    #[cfg(windows)]
    pub async fn serve(self, service: Arc<TunnelService>, shutdown: CancellationToken) -> Result<()> {
        let mut server = pipe::create(&self.pipe_name, true)?;
        info!(pipe = self.pipe_name.as_str(), "ipc server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = server.connect() => {
                    if let Err(e) = connected {
                        warn!(error = %e, "ipc pipe connect failed");
                        server = pipe::create(&self.pipe_name, false)?;
                        continue;
                    }
                    // 先创建下一个实例，避免客户端在间隙中看到 NotFound
                    let stream = std::mem::replace(&mut server, pipe::create(&self.pipe_name, false)?);
                    let service = service.clone();
                    let read_timeout = self.read_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &service, read_timeout).await {
                            debug!(error = %e, "ipc connection error");
                        }
                    });
                }
            }
        }

        info!("ipc server stopped");
        Ok(())
    }
}

/// 读取一行请求，写回一行响应；请求行必须在 read_timeout 内到达
pub async fn handle_connection<S>(
    stream: S,
    service: &TunnelService,
    read_timeout: Duration,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
    let mut line = String::new();
    tokio::time::timeout(read_timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "ipc request read timed out"))??;

    let response = match serde_json::from_str::<Request>(line.trim()) {
        Ok(request) => dispatch(service, request).await,
        Err(e) => Response::error(CODE_BAD_REQUEST, format!("bad request: {}", e)),
    };

    let mut payload = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    writer.shutdown().await
}

#[cfg(windows)]
mod pipe {
    use std::ffi::c_void;
    use std::io;
    use std::ptr;

    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use windows_sys::Win32::Foundation::LocalFree;
    use windows_sys::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows_sys::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};

    /// SYSTEM 与管理员完全控制，交互式用户读写
    const PIPE_SDDL: &str = "D:(A;;GA;;;SY)(A;;GA;;;BA)(A;;GRGW;;;IU)";

    pub(super) fn create(name: &str, first: bool) -> io::Result<NamedPipeServer> {
        let sddl: Vec<u16> = PIPE_SDDL.encode_utf16().chain(std::iter::once(0)).collect();
        let mut descriptor: PSECURITY_DESCRIPTOR = ptr::null_mut();
        // SAFETY: sddl 以 NUL 结尾，descriptor 由系统分配，使用后 LocalFree
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut attrs = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor,
            bInheritHandle: 0,
        };
        let result = unsafe {
            ServerOptions::new()
                .first_pipe_instance(first)
                .reject_remote_clients(true)
                .create_with_security_attributes_raw(name, &mut attrs as *mut _ as *mut c_void)
        };
        unsafe {
            LocalFree(descriptor);
        }
        result
    }
}
