use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::settings;

const BASE_INIT_SCRIPT: &str = include_str!("../cloudinit/paropal-base-init.sh");
const BLOCK_INIT_SCRIPT: &str = include_str!("../cloudinit/paropal-block-init.sh");
const BLOCK_INIT_SERVICE: &str = include_str!("../cloudinit/paropal-block-init.service");
const BLOCK_INIT_TIMER: &str = include_str!("../cloudinit/paropal-block-init.timer");

const BASE_INIT_PATH: &str = "/usr/local/sbin/paropal-base-init.sh";
const BLOCK_INIT_PATH: &str = "/usr/local/sbin/paropal-block-init.sh";
const BLOCK_INIT_SERVICE_PATH: &str = "/etc/systemd/system/paropal-block-init.service";
const BLOCK_INIT_TIMER_PATH: &str = "/etc/systemd/system/paropal-block-init.timer";

/// Inputs of the `#cloud-config` document handed to new instances.
#[derive(Clone, Debug)]
pub struct CloudInit {
    pub time_zone: String,
    pub locale: String,
    pub primary_user: String,
}

impl Default for CloudInit {
    fn default() -> Self {
        Self {
            time_zone: settings::CLOUD_INIT_TIME_ZONE.to_string(),
            locale: settings::CLOUD_INIT_LOCALE.to_string(),
            primary_user: settings::PROVISION_PRIMARY_USER.to_string(),
        }
    }
}

/// Prefixes every line with `spaces` spaces.
fn indent(spaces: usize, s: &str) -> String {
    if spaces == 0 || s.is_empty() {
        return s.to_string();
    }
    let pad = " ".repeat(spaces);
    let mut out = String::with_capacity(s.len() + spaces * 8);
    for line in s.split_inclusive('\n') {
        out.push_str(&pad);
        out.push_str(line);
    }
    out
}

fn push_file(doc: &mut String, path: &str, permissions: &str, content: &str) {
    doc.push_str(&format!("  - path: {}\n", path));
    doc.push_str("    owner: root:root\n");
    doc.push_str(&format!("    permissions: '{}'\n", permissions));
    doc.push_str("    content: |\n");
    doc.push_str(&indent(6, content));
    if !content.ends_with('\n') {
        doc.push('\n');
    }
}

impl CloudInit {
    pub fn render(&self) -> String {
        let mut doc = String::new();
        doc.push_str("#cloud-config\n");
        doc.push_str(&format!("timezone: {}\n", self.time_zone));
        doc.push_str(&format!("locale: {}\n", self.locale));
        doc.push('\n');

        doc.push_str("users:\n");
        doc.push_str("  - default\n");
        doc.push_str(&format!("  - name: {}\n", self.primary_user));
        doc.push_str("    groups: [sudo]\n");
        doc.push_str("    shell: /bin/bash\n");
        doc.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
        doc.push('\n');

        doc.push_str("write_files:\n");
        push_file(&mut doc, BASE_INIT_PATH, "0755", BASE_INIT_SCRIPT);
        push_file(&mut doc, BLOCK_INIT_PATH, "0755", BLOCK_INIT_SCRIPT);
        push_file(&mut doc, BLOCK_INIT_SERVICE_PATH, "0644", BLOCK_INIT_SERVICE);
        push_file(&mut doc, BLOCK_INIT_TIMER_PATH, "0644", BLOCK_INIT_TIMER);
        doc.push('\n');

        doc.push_str("runcmd:\n");
        doc.push_str("  - [systemctl, daemon-reload]\n");
        doc.push_str("  - [systemctl, enable, --now, paropal-block-init.timer]\n");
        doc.push_str(&format!("  - [{}, {}]\n", BASE_INIT_PATH, self.primary_user));
        doc
    }
}

/// Vultr expects `user_data` as standard base64.
pub fn encode_user_data(doc: &str) -> String {
    STANDARD.encode(doc.as_bytes())
}
