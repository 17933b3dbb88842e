use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::api::{self, Comment, Confession, ConfessionDraft, LoginData, PageRequest, RegisterData};
use crate::board::{Board, CommentDraft};
use crate::config;
use crate::data::{self, Feed};
use crate::gateway::{Gateway, ReqwestTransport};
use crate::logging;
use crate::preferences::{FontSize, Preferences};
use crate::session::{CredentialBackend, SessionError, TokenStore};
use crate::storage;

const TITLE_WIDTH: usize = 32;
const WRAP_WIDTH: usize = 78;

pub const USAGE: &str = "\
Confession Board - post, like and comment from the terminal.

Usage: confession-board [FLAGS] <COMMAND> [ARGS]

Commands:
  login <username> <password>          Log in and remember the session
  register <username> <password> <name>
  logout                               Forget the stored session
  feed [mine|community|hot] [page]     List posts
  show <post-id>                       Show a post with its comment thread
  like <post-id>                       Toggle your like on a post
  comment <post-id> <text>             Comment on a post
  reply <post-id> <comment-id> <text>  Reply to a comment
  post <title> <text> [--anonymous]    Publish a confession
  delete <post-id>                     Delete one of your posts
  me                                   Show your profile
  profile <username>                   Show someone else's profile
  block <username> | unblock <username>
  blacklist                            List blocked users
  theme [--color #rrggbb] [--font small|medium|large]
  server <base-url>                    Save the backend address

Flags:
  --version, -V        Show version and exit
  --help,    -h        Show this help message";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Login { username: String, password: String },
    Register { username: String, password: String, name: String },
    Logout,
    Feed { feed: Feed, page: u32 },
    Show { post_id: i64 },
    Like { post_id: i64 },
    Comment { post_id: i64, content: String },
    Reply { post_id: i64, parent_id: i64, content: String },
    Post { title: String, content: String, anonymous: bool },
    Delete { post_id: i64 },
    Me,
    Profile { username: String },
    Block { username: String },
    Unblock { username: String },
    Blacklist,
    Theme { color: Option<String>, font: Option<FontSize> },
    Server { base_url: String },
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!("missing command");
        };
        let arg = |index: usize, what: &str| -> Result<String> {
            rest.get(index)
                .cloned()
                .ok_or_else(|| anyhow!("{name}: missing {what}"))
        };
        let id = |index: usize, what: &str| -> Result<i64> {
            let raw = arg(index, what)?;
            raw.parse()
                .with_context(|| format!("{name}: {what} must be a number, got {raw:?}"))
        };

        let command = match name.as_str() {
            "login" => Command::Login {
                username: arg(0, "username")?,
                password: arg(1, "password")?,
            },
            "register" => Command::Register {
                username: arg(0, "username")?,
                password: arg(1, "password")?,
                name: arg(2, "display name")?,
            },
            "logout" => Command::Logout,
            "feed" => {
                let feed = match rest.first() {
                    Some(key) => data::feed_from_key(key)
                        .ok_or_else(|| anyhow!("feed: unknown feed {key:?}"))?,
                    None => Feed::Community,
                };
                let page = match rest.get(1) {
                    Some(raw) => raw
                        .parse()
                        .with_context(|| format!("feed: page must be a number, got {raw:?}"))?,
                    None => 1,
                };
                Command::Feed { feed, page }
            }
            "show" => Command::Show {
                post_id: id(0, "post id")?,
            },
            "like" => Command::Like {
                post_id: id(0, "post id")?,
            },
            "comment" => Command::Comment {
                post_id: id(0, "post id")?,
                content: rest.get(1..).unwrap_or_default().join(" "),
            },
            "reply" => Command::Reply {
                post_id: id(0, "post id")?,
                parent_id: id(1, "comment id")?,
                content: rest.get(2..).unwrap_or_default().join(" "),
            },
            "post" => {
                let anonymous = rest.iter().any(|a| a == "--anonymous");
                let mut words = rest.iter().filter(|a| *a != "--anonymous");
                let title = words
                    .next()
                    .cloned()
                    .ok_or_else(|| anyhow!("post: missing title"))?;
                let content = words.cloned().collect::<Vec<_>>().join(" ");
                Command::Post {
                    title,
                    content,
                    anonymous,
                }
            }
            "delete" => Command::Delete {
                post_id: id(0, "post id")?,
            },
            "me" => Command::Me,
            "profile" => Command::Profile {
                username: arg(0, "username")?,
            },
            "block" => Command::Block {
                username: arg(0, "username")?,
            },
            "unblock" => Command::Unblock {
                username: arg(0, "username")?,
            },
            "blacklist" => Command::Blacklist,
            "theme" => {
                let mut color = None;
                let mut font = None;
                let mut iter = rest.iter();
                while let Some(flag) = iter.next() {
                    match flag.as_str() {
                        "--color" => color = iter.next().cloned(),
                        "--font" => {
                            let raw = iter
                                .next()
                                .ok_or_else(|| anyhow!("theme: --font needs a size"))?;
                            font = Some(raw.parse()?);
                        }
                        other => bail!("theme: unknown option {other:?}"),
                    }
                }
                Command::Theme { color, font }
            }
            "server" => Command::Server {
                base_url: arg(0, "base url")?,
            },
            other => bail!("unknown command {other:?}"),
        };
        Ok(command)
    }
}

/// Everything a command needs, wired from configuration.
struct Services {
    store: storage::Store,
    client: Arc<api::Client>,
    board: Board,
}

impl Services {
    fn open(cfg: &config::Config) -> Result<Self> {
        let store = storage::Store::open(storage::Options {
            path: cfg.storage.path.clone(),
        })
        .context("open storage")?;
        let backend: Arc<dyn CredentialBackend> = Arc::new(store.clone());
        let tokens = Arc::new(TokenStore::load(backend).context("load session")?);

        let transport =
            ReqwestTransport::new(cfg.transport_config()).context("build HTTP transport")?;
        let gateway = Arc::new(Gateway::new(
            Arc::new(transport),
            tokens,
            cfg.gateway_config(),
        ));
        let client = Arc::new(api::Client::new(gateway));
        let board = Board::new(Arc::new(data::ApiService::new(client.clone())));
        Ok(Self {
            store,
            client,
            board,
        })
    }

    fn require_login(&self) -> Result<()> {
        if self.client.tokens().is_logged_in() {
            Ok(())
        } else {
            Err(SessionError::NotLoggedIn)
                .context("run `confession-board login <username> <password>` first")
        }
    }
}

pub fn run(command: Command) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    logging::init(&cfg.logging.level)?;

    if let Command::Server { base_url } = &command {
        let path = config::save_server(None, base_url)?;
        println!("Saved backend {} to {}", base_url, friendly_path(&path));
        return Ok(());
    }

    let ctx = Services::open(&cfg)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let output = runtime.block_on(execute(&ctx, command))?;
    if !output.is_empty() {
        println!("{}", output.trim_end());
    }
    Ok(())
}

async fn execute(ctx: &Services, command: Command) -> Result<String> {
    let mut out = String::new();
    match command {
        Command::Login { username, password } => {
            ctx.client
                .login(&LoginData {
                    username: username.clone(),
                    password,
                })
                .await
                .context("login")?;
            writeln!(out, "Logged in as {username}")?;
        }
        Command::Register {
            username,
            password,
            name,
        } => {
            ctx.client
                .register(&RegisterData {
                    username: username.clone(),
                    password,
                    name,
                    usertype: 0,
                    avatar: None,
                })
                .await
                .context("register")?;
            writeln!(out, "Registered and logged in as {username}")?;
        }
        Command::Logout => {
            ctx.client.logout();
            writeln!(out, "Logged out")?;
        }
        Command::Feed { feed, page } => {
            ctx.require_login()?;
            let size = feed.default_page().size;
            let listing = ctx
                .board
                .load_feed(feed, PageRequest::new(page, size))
                .await
                .with_context(|| format!("load {feed} feed"))?;
            writeln!(
                out,
                "{} feed, page {}/{} ({} posts)",
                feed,
                listing.current.max(1),
                listing.pages.max(1),
                listing.total
            )?;
            for post in &listing.posts {
                write_post_line(&mut out, post)?;
            }
        }
        Command::Show { post_id } => {
            ctx.require_login()?;
            let detail = ctx.board.load_detail(post_id).await.context("load post")?;
            write_post_line(&mut out, &detail.post)?;
            if !detail.post.content.is_empty() {
                writeln!(out, "\n{}\n", textwrap::fill(&detail.post.content, WRAP_WIDTH))?;
            }
            write_thread(&mut out, &detail.comments, 0)?;
        }
        Command::Like { post_id } => {
            ctx.require_login()?;
            ctx.board.load_detail(post_id).await.context("load post")?;
            let state = ctx.board.toggle_like(post_id).await.context("toggle like")?;
            let verb = if state.liked { "Liked" } else { "Unliked" };
            writeln!(out, "{verb} post {post_id} ({} likes)", state.likes)?;
        }
        Command::Comment { post_id, content } => {
            ctx.require_login()?;
            ctx.board.load_detail(post_id).await.context("load post")?;
            let comment = ctx
                .board
                .submit_comment(CommentDraft::root(post_id, content))
                .await
                .context("post comment")?;
            writeln!(out, "Comment #{} posted", comment.id)?;
        }
        Command::Reply {
            post_id,
            parent_id,
            content,
        } => {
            ctx.require_login()?;
            ctx.board.load_detail(post_id).await.context("load post")?;
            let comment = ctx
                .board
                .submit_comment(CommentDraft::reply(post_id, parent_id, content))
                .await
                .context("post reply")?;
            writeln!(out, "Reply #{} posted under #{}", comment.id, parent_id)?;
        }
        Command::Post {
            title,
            content,
            anonymous,
        } => {
            ctx.require_login()?;
            let draft = ConfessionDraft {
                send_time: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                title,
                content,
                photos: Vec::new(),
                open: true,
                anonymous,
            };
            let created = ctx.board.create_post(&draft).await.context("create post")?;
            writeln!(out, "Published post #{}", created.id)?;
        }
        Command::Delete { post_id } => {
            ctx.require_login()?;
            ctx.board.delete_post(post_id).await.context("delete post")?;
            writeln!(out, "Deleted post #{post_id}")?;
        }
        Command::Me => {
            ctx.require_login()?;
            let profile = ctx.client.me().await.context("load profile")?;
            writeln!(out, "{} (@{})", profile.name, profile.username)?;
        }
        Command::Profile { username } => {
            ctx.require_login()?;
            let profile = ctx.client.profile(&username).await.context("load profile")?;
            writeln!(out, "{} (@{})", profile.name, profile.username)?;
        }
        Command::Block { username } => {
            ctx.require_login()?;
            ctx.client.block(&username).await.context("block user")?;
            writeln!(out, "Blocked {username}")?;
        }
        Command::Unblock { username } => {
            ctx.require_login()?;
            ctx.client.unblock(&username).await.context("unblock user")?;
            writeln!(out, "Unblocked {username}")?;
        }
        Command::Blacklist => {
            ctx.require_login()?;
            let blocked = ctx.client.blacklist().await.context("load blacklist")?;
            if blocked.is_empty() {
                writeln!(out, "Nobody is blocked")?;
            }
            for profile in blocked {
                writeln!(out, "{} (@{})", profile.name, profile.username)?;
            }
        }
        Command::Theme { color, font } => {
            let prefs = Preferences::new(ctx.store.clone());
            if let Some(color) = color {
                prefs.set_primary_color(&color)?;
            }
            if let Some(font) = font {
                prefs.set_font_size(font)?;
            }
            let theme = prefs.theme()?;
            writeln!(
                out,
                "primary colour {}, font {} ({}px)",
                theme.primary_color,
                theme.font_size,
                theme.font_size.pixels()
            )?;
        }
        Command::Server { .. } => {}
    }
    Ok(out)
}

fn write_post_line(out: &mut String, post: &Confession) -> std::fmt::Result {
    let author = if post.anonymous {
        "anonymous"
    } else if !post.name.is_empty() {
        post.name.as_str()
    } else {
        post.poster_name.as_str()
    };
    let heart = if post.liked { "♥" } else { "♡" };
    writeln!(
        out,
        "#{:<6} {} {} {:>4}  {}  by {}",
        post.id,
        fit_width(&post.title, TITLE_WIDTH),
        heart,
        post.likes,
        post.create_at,
        author
    )
}

/// Truncates or pads `text` to exactly `width` terminal columns.
fn fit_width(text: &str, width: usize) -> String {
    let mut fitted = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + w > width {
            if fitted.pop().is_some() {
                fitted.push('…');
            }
            break;
        }
        fitted.push(ch);
        used += w;
    }
    let padding = width.saturating_sub(UnicodeWidthStr::width(fitted.as_str()));
    fitted.extend(std::iter::repeat(' ').take(padding));
    fitted
}

fn write_thread(out: &mut String, forest: &[Comment], depth: usize) -> std::fmt::Result {
    for comment in forest {
        writeln!(
            out,
            "{:indent$}#{} {}: {}",
            "",
            comment.id,
            comment.author,
            comment.content,
            indent = depth * 2
        )?;
        write_thread(out, &comment.replies, depth + 1)?;
    }
    Ok(())
}

fn friendly_path(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            let mut display = String::from("~");
            if !stripped.as_os_str().is_empty() {
                display.push_str(&format!("/{}", stripped.display()));
            }
            return display;
        }
    }
    path.display().to_string()
}
