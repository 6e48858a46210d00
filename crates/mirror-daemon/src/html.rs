//! Inline HTML templates for the index and key-entry pages

/// Index page listing every mirrored file, fetched from `/list`
pub fn index_page() -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Encrypted Mirror</title>
    <style>{}</style>
</head>
<body>
    <div class="container wide">
        <h1>Encrypted Mirror</h1>
        <p>Files are stored encrypted. Each link carries the key needed to decrypt it.</p>
        <table>
            <thead><tr><th>Name</th><th>Size</th></tr></thead>
            <tbody id="files"></tbody>
        </table>
        <div id="status" class="status hidden"></div>
    </div>

    <script>
    {}
    </script>
</body>
</html>"#,
        CSS_STYLES, INDEX_JS
    )
}

/// Key-entry page for `/file/{hash}` requested without a key
pub fn key_page(hash: &str, filename: Option<&str>) -> String {
    let filename_input = filename
        .map(|f| format!(r#"<input type="hidden" name="filename" value="{}">"#, html_escape(f)))
        .unwrap_or_default();
    let title = filename.unwrap_or(hash);

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Enter Key - Encrypted Mirror</title>
    <style>{}</style>
</head>
<body>
    <div class="container">
        <h1>Enter Key</h1>
        <p>A key is required to download <code>{}</code>.</p>

        <form method="get" action="/file/{}">
            {}
            <div class="field">
                <label for="key">Key</label>
                <input type="text" id="key" name="key" required autocomplete="off" placeholder="base64url key">
            </div>
            <button type="submit">Download</button>
        </form>
    </div>
</body>
</html>"#,
        CSS_STYLES,
        html_escape(title),
        html_escape(hash),
        filename_input
    )
}

/// Escape HTML special characters
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

const INDEX_JS: &str = r#"
const tbody = document.getElementById('files');
const status = document.getElementById('status');

function formatSize(bytes) {
    const units = ['B', 'KiB', 'MiB', 'GiB'];
    let size = bytes;
    let unit = 0;
    while (size >= 1024 && unit < units.length - 1) {
        size /= 1024;
        unit++;
    }
    return (unit === 0 ? size : size.toFixed(1)) + ' ' + units[unit];
}

async function load() {
    try {
        const res = await fetch('/list');
        if (!res.ok) throw new Error('HTTP ' + res.status);
        const data = await res.json();

        if (data.files.length === 0) {
            status.textContent = 'No files mirrored yet.';
            status.className = 'status';
            return;
        }

        for (const file of data.files) {
            const base = file.name.split('/').pop();
            const params = new URLSearchParams({ filename: base, key: file.key });
            const row = document.createElement('tr');
            const name = document.createElement('td');
            const link = document.createElement('a');
            link.href = '/file/' + file.hash + '?' + params.toString();
            link.textContent = file.name;
            name.appendChild(link);
            const size = document.createElement('td');
            size.textContent = formatSize(file.size);
            row.appendChild(name);
            row.appendChild(size);
            tbody.appendChild(row);
        }
    } catch (err) {
        status.textContent = 'Failed to load file list: ' + err.message;
        status.className = 'status error';
    }
}

load();
"#;

const CSS_STYLES: &str = r#"
* {
    box-sizing: border-box;
}
body {
    font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
    background: #1a1a2e;
    color: #eee;
    margin: 0;
    padding: 20px;
    min-height: 100vh;
    display: flex;
    align-items: center;
    justify-content: center;
}
.container {
    background: #16213e;
    padding: 40px;
    border-radius: 12px;
    max-width: 400px;
    width: 100%;
    box-shadow: 0 4px 20px rgba(0,0,0,0.3);
}
.container.wide {
    max-width: 800px;
}
h1 {
    margin: 0 0 10px 0;
    color: #fff;
    font-size: 24px;
}
p {
    color: #aaa;
    margin: 0 0 20px 0;
}
code {
    word-break: break-all;
}
table {
    width: 100%;
    border-collapse: collapse;
}
th, td {
    text-align: left;
    padding: 8px;
    border-bottom: 1px solid #0f3460;
}
a {
    color: #7f9cf5;
}
.field {
    margin-bottom: 20px;
}
label {
    display: block;
    margin-bottom: 8px;
    color: #ccc;
}
input {
    width: 100%;
    padding: 12px;
    border: 1px solid #0f3460;
    border-radius: 6px;
    background: #1a1a2e;
    color: #fff;
    font-size: 16px;
}
button {
    width: 100%;
    padding: 14px;
    background: #e94560;
    color: #fff;
    border: none;
    border-radius: 6px;
    font-size: 16px;
    cursor: pointer;
}
.status {
    margin-top: 20px;
    padding: 12px;
    border-radius: 6px;
    background: #0f3460;
}
.status.error {
    background: #5c1a2a;
}
.hidden {
    display: none;
}
"#;
