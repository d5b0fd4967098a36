use std::sync::Arc;

use bookshelf::{
    BookFeed, BookFilters, CatalogClient, CatalogError, ClientConfig, ConfigError, OrderError, OrdersClient,
    PlaceOrder, ReqwestTransport, SessionError, SessionManager, SignupOutcome, Transport, TransportError,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error("not logged in; pass --email and --password or set BOOKSHELF_EMAIL and BOOKSHELF_PASSWORD")]
    MissingCredentials,
    #[error("login rejected")]
    LoginRejected,
    #[error("signup rejected: {0}")]
    SignupRejected(String),
    #[error("book {0} not found")]
    BookNotFound(i64),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "bookshelf-cli", about = "Bookshelf storefront CLI")]
struct Cli {
    #[arg(long, env = "BOOKSHELF_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "BOOKSHELF_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Books(BooksCommand),
    Signup {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Whoami,
    Orders(OrdersCommand),
}

#[derive(Args, Debug)]
struct BooksCommand {
    #[command(subcommand)]
    command: BooksSubcommand,
}

#[derive(Subcommand, Debug)]
enum BooksSubcommand {
    List(ListArgs),
    Show { book_id: i64 },
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long)]
    search: Option<String>,

    #[arg(long)]
    genre: Option<String>,

    #[arg(long)]
    min_price: Option<u32>,

    #[arg(long)]
    max_price: Option<u32>,

    #[arg(long, default_value_t = 1)]
    page: u32,

    #[arg(long, default_value_t = bookshelf::catalog::DEFAULT_PAGE_SIZE)]
    limit: u32,

    #[arg(long, default_value_t = false, help = "Follow pagination until the listing is exhausted")]
    all: bool,
}

#[derive(Args, Debug)]
struct OrdersCommand {
    #[command(subcommand)]
    command: OrdersSubcommand,
}

#[derive(Subcommand, Debug)]
enum OrdersSubcommand {
    List,
    Place {
        #[arg(long)]
        book_id: i64,
        #[arg(long, default_value_t = 1)]
        quantity: u32,
        #[arg(long, default_value_t = false, help = "Poll until the order settles")]
        wait: bool,
    },
    Status {
        order_id: i64,
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    Pending {
        book_id: i64,
    },
}

struct CliContext {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    email: Option<String>,
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.timeouts)?);
    let ctx = CliContext { config, transport, email: cli.email, password: cli.password };

    match cli.command {
        Command::Books(books) => run_books(&ctx, books).await,
        Command::Signup { username, email, password } => run_signup(&ctx, &username, &email, &password).await,
        Command::Whoami => with_session(&ctx, run_whoami).await,
        Command::Orders(orders) => with_session(&ctx, |session| run_orders(&ctx, session, orders)).await,
    }
}

// =============================================================================
// books
// =============================================================================

async fn run_books(ctx: &CliContext, books: BooksCommand) -> Result<(), CliError> {
    let catalog = Arc::new(CatalogClient::new(&ctx.config, ctx.transport.clone()));
    match books.command {
        BooksSubcommand::List(args) => {
            let all = args.all;
            let filters = list_filters(args);
            if all {
                let mut feed = BookFeed::new(catalog, filters);
                while feed.has_more() {
                    feed.load_more().await?;
                }
                let total = feed.total();
                print_json(&json!({ "books": feed.into_books(), "total": total }))?;
            } else {
                let page = catalog.list_books(&filters).await?;
                print_json(&serde_json::to_value(page)?)?;
            }
        }
        BooksSubcommand::Show { book_id } => {
            let book = catalog.get_book(book_id).await?.ok_or(CliError::BookNotFound(book_id))?;
            print_json(&serde_json::to_value(book)?)?;
        }
    }
    Ok(())
}

fn list_filters(args: ListArgs) -> BookFilters {
    let mut filters = BookFilters { limit: args.limit.max(1), ..BookFilters::default() };
    if let Some(search) = args.search {
        filters.set_search(&search);
    }
    if let Some(genre) = args.genre {
        filters.toggle_genre(&genre);
    }
    filters.set_price_range(
        args.min_price.unwrap_or(bookshelf::catalog::PRICE_MIN),
        args.max_price.unwrap_or(bookshelf::catalog::PRICE_MAX),
    );
    filters.page = args.page.max(1);
    filters
}

// =============================================================================
// identity
// =============================================================================

async fn run_signup(ctx: &CliContext, username: &str, email: &str, password: &str) -> Result<(), CliError> {
    let session = SessionManager::new(&ctx.config, ctx.transport.clone());
    match session.signup(username, email, password).await {
        SignupOutcome::Created => print_json(&json!({ "ok": true })),
        SignupOutcome::Rejected { message } => Err(CliError::SignupRejected(message)),
    }
}

async fn run_whoami(session: Arc<SessionManager>) -> Result<(), CliError> {
    let identity = session.identity().ok_or(SessionError::NotAuthenticated)?;
    print_json(&serde_json::to_value(identity)?)
}

/// Restore or establish a session, run `f`, then end the session whatever
/// `f` returned.
async fn with_session<F, Fut>(ctx: &CliContext, f: F) -> Result<(), CliError>
where
    F: FnOnce(Arc<SessionManager>) -> Fut,
    Fut: std::future::Future<Output = Result<(), CliError>>,
{
    let session = Arc::new(SessionManager::new(&ctx.config, ctx.transport.clone()));
    if !session.initialize().await? {
        let (Some(email), Some(password)) = (ctx.email.as_deref(), ctx.password.as_deref()) else {
            return Err(CliError::MissingCredentials);
        };
        if !session.login(email, password).await {
            return Err(CliError::LoginRejected);
        }
        tracing::debug!("logged in with password");
    } else {
        tracing::debug!("session restored from cookie");
    }

    let result = f(session.clone()).await;
    if session.is_authenticated() {
        session.logout().await;
    } else {
        tracing::debug!("session already ended");
    }
    result
}

// =============================================================================
// orders
// =============================================================================

async fn run_orders(ctx: &CliContext, session: Arc<SessionManager>, orders: OrdersCommand) -> Result<(), CliError> {
    let client = OrdersClient::new(&ctx.config, session);
    match orders.command {
        OrdersSubcommand::List => {
            let history = client.my_orders().await?;
            print_json(&serde_json::to_value(history)?)?;
        }
        OrdersSubcommand::Place { book_id, quantity, wait } => {
            let catalog = CatalogClient::new(&ctx.config, client.session().transport());
            let book = catalog.get_book(book_id).await?.ok_or(CliError::BookNotFound(book_id))?;
            let placed = client.place_order(&PlaceOrder::for_book(&book, quantity.max(1))).await?;
            let order_id = placed.order_id;
            let mut out = json!({ "order": placed });
            if wait {
                tracing::info!(order_id, "waiting for order to settle");
                let status = client.wait_for_completion(order_id, ctx.config.poll).await?;
                out["final_status"] = serde_json::to_value(status)?;
            }
            print_json(&out)?;
        }
        OrdersSubcommand::Status { order_id, wait } => {
            let status = if wait {
                client.wait_for_completion(order_id, ctx.config.poll).await?
            } else {
                client.check_status(order_id).await?
            };
            print_json(&json!({ "order_id": order_id, "status": status }))?;
        }
        OrdersSubcommand::Pending { book_id } => {
            let pending = client.pending_order(book_id).await?;
            print_json(&serde_json::to_value(pending)?)?;
        }
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
