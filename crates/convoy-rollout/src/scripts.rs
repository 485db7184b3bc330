//! Remote script generation
//!
//! The core treats these as opaque text; the contracts are fixed so the
//! same command id always carries the same content, which is what makes
//! executor-level dedup safe. Upstream files are fully specified here,
//! with server lines in deterministic order, so re-applying one is
//! idempotent on the instance.

use convoy_types::EnvVar;

/// Pull (or build) the image on the instance.
pub fn prep(image_tag: &str) -> String {
    format!("set -e\ndocker pull {image_tag} || docker image inspect {image_tag} >/dev/null\n")
}

/// Start the candidate container on the side port. Env vars travel via
/// a file the script writes; its path is echoed for the caller.
pub fn start_side(
    name: &str,
    image_tag: &str,
    side_port: u16,
    app_port: u16,
    env_vars: &[EnvVar],
) -> String {
    let env_file = format!("/tmp/{name}.env");
    let mut script = String::from("set -e\n");
    script.push_str(&format!("cat > {env_file} <<'CONVOY_ENV'\n"));
    for var in env_vars {
        script.push_str(&format!("{}={}\n", var.key, var.value));
    }
    script.push_str("CONVOY_ENV\n");
    script.push_str(&format!("chmod 600 {env_file}\n"));
    script.push_str(&format!(
        "docker rm -f {name} 2>/dev/null || true\n\
         docker run -d --name {name} --env-file {env_file} -p {side_port}:{app_port} {image_tag}\n\
         echo {env_file}\n"
    ));
    script
}

/// Stop the current container, rename the candidate into place, and
/// restart it on the application port.
pub fn promote(
    current_name: &str,
    candidate_name: &str,
    image_tag: &str,
    port: u16,
    app_port: u16,
    stop_timeout_secs: u64,
) -> String {
    let env_file = format!("/tmp/{candidate_name}.env");
    format!(
        "set -e\n\
         docker stop -t {stop_timeout_secs} {current_name} 2>/dev/null || true\n\
         docker rm {current_name} 2>/dev/null || true\n\
         docker rm -f {candidate_name}\n\
         docker run -d --name {current_name} --env-file {env_file} -p {port}:{app_port} {image_tag}\n"
    )
}

/// Stop and remove the candidate without touching the current container.
pub fn stop_candidate(candidate_name: &str) -> String {
    format!("set -e\ndocker rm -f {candidate_name} 2>/dev/null || true\n")
}

/// Restore the previous image on the application port and clean up the
/// candidate.
pub fn rollback(
    current_name: &str,
    candidate_name: &str,
    previous_image_tag: &str,
    port: u16,
    app_port: u16,
    stop_timeout_secs: u64,
) -> String {
    format!(
        "set -e\n\
         docker rm -f {candidate_name} 2>/dev/null || true\n\
         docker stop -t {stop_timeout_secs} {current_name} 2>/dev/null || true\n\
         docker rm {current_name} 2>/dev/null || true\n\
         docker run -d --name {current_name} -p {port}:{app_port} {previous_image_tag}\n"
    )
}

/// Write the reverse-proxy upstream file and reload. `servers` are
/// `(address, weight)` pairs, emitted in the caller's order so content
/// is reproducible byte-for-byte.
pub fn upstream_apply(servers: &[(String, u32)]) -> String {
    let content = upstream_content(servers);
    format!(
        "set -e\n\
         cat > /etc/nginx/conf.d/convoy-upstream.conf <<'CONVOY_UPSTREAM'\n\
         {content}\
         CONVOY_UPSTREAM\n\
         nginx -s reload\n"
    )
}

/// The upstream file body. Integer weights must sum to 100; callers
/// assign rounding slack to the production side before calling.
pub fn upstream_content(servers: &[(String, u32)]) -> String {
    let mut out = String::from("upstream convoy_app {\n");
    for (address, weight) in servers {
        out.push_str(&format!("    server {address} weight={weight};\n"));
    }
    out.push_str("}\n");
    out
}
