//! WS-Management SOAP envelopes and response scraping for the WinRM shell.
//!
//! Responses are scanned with plain string search; only the handful of
//! elements the executor needs are extracted.

use base64::prelude::*;
use uuid::Uuid;

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// Resource URI of the classic `cmd` remote shell.
pub const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Maximum envelope size advertised to the server.
pub const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Server-side wait for a single Receive before it answers with a fault.
pub const OPERATION_TIMEOUT_SECS: u64 = 20;

/// WS-Management fault code for an expired Receive with no new output.
const OPERATION_TIMEOUT_FAULT: &str = "2150858793";

/// Builds envelopes addressed at one endpoint.
#[derive(Debug, Clone)]
pub struct Envelopes {
    endpoint: String,
}

impl Envelopes {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn create_shell(&self) -> String {
        self.envelope(
            ACTION_CREATE,
            None,
            r#"<rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>"#,
        )
    }

    pub fn command(&self, shell_id: &str, command: &str) -> String {
        let body = format!(
            r#"<rsp:CommandLine>
      <rsp:Command>{}</rsp:Command>
    </rsp:CommandLine>"#,
            xml_escape(command)
        );
        self.envelope(ACTION_COMMAND, Some(shell_id), &body)
    }

    pub fn receive(&self, shell_id: &str, command_id: &str) -> String {
        let body = format!(
            r#"<rsp:Receive>
      <rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>"#,
            xml_escape(command_id)
        );
        self.envelope(ACTION_RECEIVE, Some(shell_id), &body)
    }

    pub fn terminate(&self, shell_id: &str, command_id: &str) -> String {
        let body = format!(
            r#"<rsp:Signal CommandId="{}">
      <rsp:Code>{SIGNAL_TERMINATE}</rsp:Code>
    </rsp:Signal>"#,
            xml_escape(command_id)
        );
        self.envelope(ACTION_SIGNAL, Some(shell_id), &body)
    }

    pub fn delete_shell(&self, shell_id: &str) -> String {
        self.envelope(ACTION_DELETE, Some(shell_id), "")
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, body: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    r#"
    <w:SelectorSet>
      <w:Selector Name="ShellId">{}</w:Selector>
    </w:SelectorSet>"#,
                    xml_escape(id)
                )
            })
            .unwrap_or_default();
        let body = if body.is_empty() {
            "<s:Body/>".to_string()
        } else {
            format!("<s:Body>\n    {}\n  </s:Body>", body)
        };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{OPERATION_TIMEOUT_SECS}S</w:OperationTimeout>{selector}
  </s:Header>
  {body}
</s:Envelope>"#,
            endpoint = xml_escape(&self.endpoint),
            message_id = Uuid::new_v4(),
        )
    }
}

/// Output gathered from one Receive response.
#[derive(Debug, Default, PartialEq)]
pub struct ReceiveChunk {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub done: bool,
}

/// Shell id from a Create response.
pub fn extract_shell_id(response: &str) -> Option<String> {
    element_text(response, "<rsp:ShellId>", "</rsp:ShellId>").or_else(|| {
        let start = response.find("ShellId\">")? + "ShellId\">".len();
        let end = response[start..].find("</")?;
        Some(response[start..start + end].trim().to_string())
    })
}

/// Command id from a Command response.
pub fn extract_command_id(response: &str) -> Option<String> {
    element_text(response, "<rsp:CommandId>", "</rsp:CommandId>")
}

/// Decode the stream chunks, exit code and completion flag of a Receive response.
pub fn parse_receive(response: &str) -> ReceiveChunk {
    let exit_code = element_text(response, "<rsp:ExitCode>", "</rsp:ExitCode>")
        .and_then(|code| code.parse::<i32>().ok());

    ReceiveChunk {
        stdout: decode_streams(response, "stdout"),
        stderr: decode_streams(response, "stderr"),
        exit_code,
        done: response.contains("CommandState=\"Done\"")
            || response.contains("State=\"Done\"")
            || response.contains("/CommandState/Done\""),
    }
}

/// Whether a fault only reports that the Receive wait expired.
pub fn is_operation_timeout(response: &str) -> bool {
    response.contains(OPERATION_TIMEOUT_FAULT)
}

/// Human-readable reason from a SOAP fault, if any.
pub fn fault_reason(response: &str) -> Option<String> {
    let start = response.find("<s:Text")?;
    let open_end = response[start..].find('>')? + start + 1;
    let close = response[open_end..].find("</s:Text>")? + open_end;
    let text = response[open_end..close].trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Wrap a PowerShell script as a `-EncodedCommand` command line.
pub fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    format!(
        "powershell.exe -NoProfile -NonInteractive -EncodedCommand {}",
        BASE64_STANDARD.encode(utf16)
    )
}

/// Quote a value as a single-quoted PowerShell literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn element_text(response: &str, open: &str, close: &str) -> Option<String> {
    let start = response.find(open)? + open.len();
    let end = response[start..].find(close)?;
    Some(response[start..start + end].trim().to_string())
}

fn decode_streams(response: &str, name: &str) -> Vec<u8> {
    let marker = format!("<rsp:Stream Name=\"{}\"", name);
    let mut out = Vec::new();
    let mut pos = 0;

    while let Some(found) = response[pos..].find(&marker) {
        let tag_start = pos + found;
        let Some(tag_len) = response[tag_start..].find('>') else {
            break;
        };
        // Self-closing tags carry no data.
        if response[tag_start..tag_start + tag_len].ends_with('/') {
            pos = tag_start + tag_len + 1;
            continue;
        }
        let content_start = tag_start + tag_len + 1;
        let Some(len) = response[content_start..].find("</rsp:Stream>") else {
            break;
        };
        let content = response[content_start..content_start + len].trim();
        if let Ok(bytes) = BASE64_STANDARD.decode(content) {
            out.extend_from_slice(&bytes);
        }
        pos = content_start + len;
    }
    out
}
