use chrono::{Duration, SubsecRound, Utc};
use infohub_api::{PostType, Team, BCRYPT_COST, MAX_REPLY_DEPTH};
use rand::{seq::SliceRandom, Rng};
use uuid::Uuid;

const NUM_USERS: usize = 12;
const NUM_ADMINS: usize = 2;
const PASSWORD: &str = "password123";

const NUM_POSTS: usize = 150;
const POST_TITLE_LEN: usize = 8;
const POST_CONTENT_LEN: usize = 120;
const MAX_TAGS_PER_POST: usize = 3;
const TAGS: [&str; 10] = [
    "AWS", "Azure", "Security", "Networking", "Onboarding", "Budget", "SOP", "Migration",
    "Monitoring", "Identity",
];

const NUM_COMMENTS: usize = 600;
const REPLY_PERCENT: f64 = 0.4;
const COMMENT_LEN: usize = 25;

const NUM_POST_LIKES: usize = 400;
const NUM_COMMENT_LIKES: usize = 400;

/// Quoted SQL string literal
fn sql_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn gen_n_items(table: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    println!("INSERT INTO {} VALUES", table);
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn main() {
    let mut rng = rand::thread_rng();
    let now = Utc::now().trunc_subsecs(6);
    let gen_date = |rng: &mut rand::rngs::ThreadRng| {
        now - Duration::seconds(rng.gen_range(0..90 * 24 * 3600))
    };

    // Generate users, all sharing the same password
    let hash = bcrypt::hash(PASSWORD, BCRYPT_COST).expect("hashing test password");
    let mut users = Vec::new();
    gen_n_items(
        "users (id, email, password, full_name, role, team, created_at)",
        NUM_USERS,
        |i| {
            let id = Uuid::new_v4();
            users.push(id);
            let full_name = lipsum::lipsum_words(2);
            let role = match i < NUM_ADMINS {
                true => "Admin",
                false => "User",
            };
            format!(
                "('{id}', {}, {}, {}, '{role}', {}, '{}')",
                sql_str(&format!("user{i}@infohub.example")),
                sql_str(&hash),
                sql_str(&full_name),
                sql_str(Team::ALL.choose(&mut rng).expect("teams").as_str()),
                gen_date(&mut rng).to_rfc3339(),
            )
        },
    );

    // Generate posts
    let mut posts = Vec::new();
    gen_n_items(
        "posts (id, author_id, title, content, type, tags, views, created_at)",
        NUM_POSTS,
        |_| {
            let id = Uuid::new_v4();
            let date = gen_date(&mut rng);
            posts.push((id, date));
            let num_tags = rng.gen_range(0..=MAX_TAGS_PER_POST);
            let tags = TAGS
                .choose_multiple(&mut rng, num_tags)
                .map(|t| sql_str(t))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "('{id}', '{}', {}, {}, '{}', ARRAY[{tags}]::TEXT[], {}, '{}')",
                users.choose(&mut rng).expect("users"),
                sql_str(&lipsum::lipsum_words_with_rng(&mut rng, POST_TITLE_LEN)),
                sql_str(&lipsum::lipsum_words_with_rng(&mut rng, POST_CONTENT_LEN)),
                PostType::ALL.choose(&mut rng).expect("post types").as_str(),
                rng.gen_range(0..500),
                date.to_rfc3339(),
            )
        },
    );

    // Generate comments, replies pointing to an earlier comment of the same post
    let mut comments: Vec<(Uuid, Uuid, chrono::DateTime<Utc>, usize)> = Vec::new();
    gen_n_items(
        "comments (id, author_id, post_id, parent_id, content, created_at)",
        NUM_COMMENTS,
        |_| {
            let id = Uuid::new_v4();
            let parent = match rng.gen_bool(REPLY_PERCENT) {
                true => comments
                    .choose(&mut rng)
                    .copied()
                    .filter(|&(_, _, _, depth)| depth < MAX_REPLY_DEPTH),
                false => None,
            };
            let (post, parent_id, date, depth) = match parent {
                Some((parent, post, date, depth)) => (
                    post,
                    format!("'{parent}'"),
                    date + Duration::minutes(rng.gen_range(1..600)),
                    depth + 1,
                ),
                None => {
                    let (post, date) = *posts.choose(&mut rng).expect("posts");
                    (
                        post,
                        String::from("NULL"),
                        date + Duration::minutes(rng.gen_range(1..600)),
                        0,
                    )
                }
            };
            comments.push((id, post, date, depth));
            format!(
                "('{id}', '{}', '{post}', {parent_id}, {}, '{}')",
                users.choose(&mut rng).expect("users"),
                sql_str(&lipsum::lipsum_words_with_rng(&mut rng, COMMENT_LEN)),
                date.to_rfc3339(),
            )
        },
    );

    // Generate likes, duplicates are dropped by the unique constraints
    gen_n_items(
        "likes (id, user_id, post_id, created_at)",
        NUM_POST_LIKES,
        |_| {
            format!(
                "('{}', '{}', '{}', '{}')",
                Uuid::new_v4(),
                users.choose(&mut rng).expect("users"),
                posts.choose(&mut rng).expect("posts").0,
                now.to_rfc3339(),
            )
        },
    );
    gen_n_items(
        "likes (id, user_id, comment_id, created_at)",
        NUM_COMMENT_LIKES,
        |_| {
            format!(
                "('{}', '{}', '{}', '{}')",
                Uuid::new_v4(),
                users.choose(&mut rng).expect("users"),
                comments.choose(&mut rng).expect("comments").0,
                now.to_rfc3339(),
            )
        },
    );
}
