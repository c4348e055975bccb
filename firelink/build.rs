fn main() {
  cfg_aliases::cfg_aliases! {
      linux: { any(target_os = "linux", target_os = "android") },
      epoll: { linux },
      iocp: { target_os = "windows" }
  }
}
