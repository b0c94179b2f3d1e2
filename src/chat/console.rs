use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Attachment, ChatTransport, IncomingMessage, Reply};

/// Drives the bot from a terminal. Every reply is printed with the channel
/// or thread it was sent to.
#[derive(Default)]
pub struct ConsoleTransport {
    next_thread: AtomicUsize,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        ConsoleTransport::default()
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send(&self, channel_id: &str, reply: Reply) -> anyhow::Result<()> {
        println!("[{}] {}\n", channel_id, reply.to_text());
        Ok(())
    }

    async fn create_thread(&self, message: &IncomingMessage, name: &str) -> anyhow::Result<String> {
        let id = format!("t{}", self.next_thread.fetch_add(1, Ordering::SeqCst) + 1);
        println!(
            "[{}] opened thread #{} \"{}\" (reply with `#{} <text>`)\n",
            message.channel_id, id, name, id
        );
        Ok(id)
    }
}

/// Turns one input line into a message.
///
/// `#<thread> <text>` replies inside a thread, `!image <path|url>` posts an
/// attachment and anything else is a plain channel message.
pub fn parse_line(line: &str, id: &str, channel_id: &str, author_id: &str) -> Option<IncomingMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut message = IncomingMessage {
        id: id.to_string(),
        channel_id: channel_id.to_string(),
        author_id: author_id.to_string(),
        content: line.to_string(),
        attachments: Vec::new(),
        from_bot: false,
    };

    if let Some(rest) = line.strip_prefix('#') {
        let (thread, text) = rest.split_once(char::is_whitespace)?;
        if thread.is_empty() || text.trim().is_empty() {
            return None;
        }
        message.channel_id = thread.to_string();
        message.content = text.trim().to_string();
    } else if let Some(reference) = line.strip_prefix("!image") {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        let filename = reference
            .split(&['?', '#'][..])
            .next()
            .and_then(|path| path.rsplit(&['/', '\\'][..]).next())
            .unwrap_or(reference);
        message.content = String::new();
        message.attachments.push(Attachment {
            filename: filename.to_string(),
            url: reference.to_string(),
        });
    }

    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_go_to_the_channel() {
        let message = parse_line("spent 50 at the market", "1", "main", "me").unwrap();
        assert_eq!(message.channel_id, "main");
        assert_eq!(message.content, "spent 50 at the market");
        assert!(message.attachments.is_empty());
    }

    #[test]
    fn hash_prefix_targets_a_thread() {
        let message = parse_line("#t3 ok, Checking Account", "2", "main", "me").unwrap();
        assert_eq!(message.channel_id, "t3");
        assert_eq!(message.content, "ok, Checking Account");
        assert!(parse_line("#t3", "3", "main", "me").is_none());
    }

    #[test]
    fn image_lines_carry_an_attachment() {
        let message = parse_line("!image https://cdn.example/r/receipt.JPG?size=2", "4", "main", "me")
            .unwrap();
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].filename, "receipt.JPG");
        assert_eq!(message.content, "");

        let local = parse_line("!image ./scans/market.png", "5", "main", "me").unwrap();
        assert_eq!(local.attachments[0].filename, "market.png");
        assert_eq!(local.attachments[0].url, "./scans/market.png");
    }

    #[tokio::test]
    async fn threads_get_sequential_ids() {
        let transport = ConsoleTransport::new();
        let message = parse_line("hello", "1", "main", "me").unwrap();
        assert_eq!(transport.create_thread(&message, "a").await.unwrap(), "t1");
        assert_eq!(transport.create_thread(&message, "b").await.unwrap(), "t2");
    }
}
