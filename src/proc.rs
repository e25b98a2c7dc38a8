use sysinfo::System;

/// Resolve a pid to its process name, if the process exists.
pub fn process_name(pid: i32) -> Option<String> {
    let sys = System::new_all();
    sys.process(sysinfo::Pid::from_u32(pid as u32))
        .map(|p| p.name().to_str().unwrap_or("").to_owned())
}
